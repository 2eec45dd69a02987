// Domain layer - Plain data shared by every other layer
pub mod fetch;
pub mod record;
pub mod signal;
pub mod status;

pub use fetch::{CacheKey, Decimation, FetchRequest, FetchResult, RangeHash, TimeFormat};
pub use record::{Record, RecordError, StreamLine};
pub use signal::SignalData;
pub use status::{Stage, StatusInfo, StatusResult};
