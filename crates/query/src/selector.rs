//! Chooses which index serves a query. Hash probes win for exact matches;
//! anything ordered (ranges, prefixes) must go to the B+ tree, which a hash
//! index cannot serve.

use crate::stats::IndexStatistics;

/// Shape of a query as seen by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    ExactMatch,
    RangeQuery,
    PrefixMatch,
    GeneralScan,
}

/// Index kinds the selector can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    BTree,
    Hash,
    None,
}

/// What the selector learned about a condition.
#[derive(Debug, Clone)]
pub struct QueryCharacteristics {
    pub query_type: QueryType,
    pub selectivity: f64,
    pub needs_sorting: bool,
}

#[derive(Default)]
pub struct IndexSelector;

impl IndexSelector {
    pub fn new() -> Self {
        Self
    }

    /// Classifies a `field op value` condition.
    pub fn analyze_condition(&self, condition: &str) -> QueryCharacteristics {
        let tokens: Vec<&str> = condition.split_whitespace().collect();
        let (query_type, selectivity) = match tokens.as_slice() {
            [_, "=", _] => (QueryType::ExactMatch, 0.001),
            [_, "<" | "<=" | ">" | ">=", _] => (QueryType::RangeQuery, 0.3),
            [_, op, value] if op.eq_ignore_ascii_case("like") => {
                if value.ends_with('%') && !value.starts_with('%') {
                    (QueryType::PrefixMatch, 0.05)
                } else {
                    (QueryType::GeneralScan, 1.0)
                }
            }
            _ => (QueryType::GeneralScan, 1.0),
        };
        QueryCharacteristics {
            query_type,
            selectivity,
            needs_sorting: query_type == QueryType::RangeQuery,
        }
    }

    /// Picks the cheapest capable index.
    pub fn select_best_index(
        &self,
        characteristics: &QueryCharacteristics,
        hash_available: bool,
    ) -> IndexType {
        match characteristics.query_type {
            QueryType::ExactMatch if hash_available && !characteristics.needs_sorting => {
                IndexType::Hash
            }
            QueryType::ExactMatch => IndexType::BTree,
            QueryType::RangeQuery | QueryType::PrefixMatch => IndexType::BTree,
            QueryType::GeneralScan => IndexType::None,
        }
    }

    /// Estimated page accesses for serving the query with the given index.
    pub fn estimate_query_cost(
        &self,
        index_type: IndexType,
        characteristics: &QueryCharacteristics,
        statistics: &IndexStatistics,
    ) -> f64 {
        let pages = statistics.page_count().max(1) as f64;
        match index_type {
            // A hash probe touches the home page and on average a fraction
            // of an overflow chain.
            IndexType::Hash => match characteristics.query_type {
                QueryType::ExactMatch => 1.5,
                _ => f64::INFINITY,
            },
            IndexType::BTree => {
                let height = statistics.height().max(1) as f64;
                height + characteristics.selectivity * pages
            }
            IndexType::None => pages,
        }
    }
}
