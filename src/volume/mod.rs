pub mod cache;
pub mod fetcher;
pub mod refresher;

pub use cache::VolumeCache;
pub use fetcher::{HttpVolumeFetcher, VolumeFetcher};
pub use refresher::{CodeSupplier, CycleReport, RefresherSettings, VolumeRefresher};
