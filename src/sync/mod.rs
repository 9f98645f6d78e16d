// Synchronisation of bundles from the remote store into the durable local store.

pub mod downloader;
pub mod run;
pub mod stages;

pub use downloader::{exists_new_release, DownloadState, Downloader, SyncContext};
pub use run::SyncRun;
pub use stages::{run_stages, StageDeps};
