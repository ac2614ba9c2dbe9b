pub mod core;
pub mod directory;
pub mod grading;
pub mod matrix;
pub mod reports;
pub mod results;
