//! readaloud: read text aloud through native, neural, or offline voices,
//! with progress tracking and automatic fallback between backends.

pub mod config;
pub mod error;
pub mod narrator;
