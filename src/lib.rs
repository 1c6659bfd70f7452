pub mod backup_stream;
pub mod cancel;
pub mod dir_driver;
pub mod driver;
pub mod exporter;
pub mod file_info;
pub mod importer;
pub mod mount;
pub mod mutated;
pub mod notifier;
pub mod release;
pub mod whiteout;

// Re-exports for easy access
pub use backup_stream::{StreamBlock, StreamKind};
pub use cancel::{is_cancelled, CancelToken, Cancelled};
pub use dir_driver::DirDriver;
pub use driver::{LayerDriver, LayerEntry, LayerReader, LayerWriter};
pub use exporter::LayerExporter;
pub use file_info::{FileAttributes, FileInfo};
pub use importer::LayerImporter;
pub use mount::{LocalMounter, Mount, Mountable};
pub use notifier::Notifier;
