pub mod augmenter;
pub mod autosave;
pub mod browser;
pub mod config;
pub mod diff;
pub mod discovery;
pub mod dom;
pub mod identity;
pub mod mount;
pub mod mutation;
pub mod panel;
pub mod pipeline;
pub mod serialize;
pub mod text;
pub mod translate;
