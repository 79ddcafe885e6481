//! Episodic screen recording engine: segments the capture stream into
//! episodes keyed by the active application context, encodes frames to video,
//! and maintains a full-text index of incrementally observed on-screen text.

pub mod cleanup;
pub mod cli;
pub mod config;
mod core;
pub mod db;
pub mod error;
pub mod expand;
pub mod index;
pub mod text_diff;
pub mod video;
pub mod video_utils;

pub use self::core::{
    AddressBarReader, LifecycleManager, PageContext, RecorderEvent, RecorderHandle,
};
pub use config::RecorderConfig;
pub use db::{BundleExclusion, DatabaseManager, Document, Episode};
pub use error::{RecorderError, Result};
pub use index::{Interval, IntervalIndex, SearchHit};
pub use video::{CapturedFrame, EncoderBackend, EncoderSession, FinalizeTracker};
