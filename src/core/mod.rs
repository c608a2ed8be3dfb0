pub mod activation;
pub mod bbox;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod error;
pub mod montage;
pub mod report;
pub mod scanner;
pub mod tightcrop;
