pub mod exchange;
pub mod market;
pub mod paper;
