pub mod relocator;
pub mod writer;
