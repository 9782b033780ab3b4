pub mod access;
pub mod clock;
pub mod incentive;
pub mod keeper;
pub mod leverage_math;
pub mod strategy;
