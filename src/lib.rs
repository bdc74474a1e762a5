//! HLS VOD downloader engine.
//!
//! Give [`VodDownloader`] a playlist URL and it materializes the
//! presentation as one contiguous local file: segments are fetched by a
//! bounded worker pool, optionally run through streaming AES-128-CBC
//! decryption, recorded in a crash-safe progress file for resume, and
//! finally concatenated in index order.
//!
//! The four collaborator seams ([`Fetcher`], [`Decryptor`],
//! [`ProgressStore`], [`Combiner`]) plus the [`VariantSelector`] are trait
//! objects; defaults for all of them are provided.

pub mod combine;
pub mod config;
pub mod decrypt;
pub mod download;
pub mod error;
pub mod fetch;
pub mod notify;
pub mod playlist;
pub mod progress;
pub mod retry;

pub use combine::{Combiner, CommandCombiner, ConcatCombiner};
pub use config::DownloadConfig;
pub use decrypt::{Aes128CbcDecryptor, Decryptor};
pub use download::{VodDownloader, segment_path};
pub use error::DownloadError;
pub use fetch::{ByteStream, Fetcher, HttpFetcher};
pub use notify::{DownloadState, ProgressListener, StateListener};
pub use playlist::{
    EncryptionMethod, EncryptionSpec, Playlist, Segment, VariantSelectionPolicy, VariantSelector,
    VariantStream,
};
pub use progress::{FileProgressStore, PROGRESS_FILE_NAME, ProgressStore};
