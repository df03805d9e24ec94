pub mod error;
pub mod index;
pub mod maintenance;
pub mod processor;
pub mod recovery;
pub mod selector;
pub mod stats;

pub use error::{QueryError, QueryResult};
pub use index::{BPlusTree, BulkLoader, HashBucket, HashIndex};
pub use maintenance::{IndexHealthReport, MaintenanceCoordinator};
pub use processor::{IndexHealth, QueryProcessor, QueryStats};
pub use recovery::{RecoveryManager, RecoveryReport};
pub use selector::{IndexSelector, IndexType, QueryCharacteristics, QueryType};
pub use stats::{IndexStatistics, KeyStats};
