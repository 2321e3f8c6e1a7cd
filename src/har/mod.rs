//! Transaction recording: HAR entries, the recorder modifier and the JSONL
//! exporter

pub mod entry;
mod exporter;
pub(crate) mod recorder;

pub use entry::{BodyCapture, Entry, HarLog};
pub use exporter::Exporter;
pub use recorder::Recorder;
