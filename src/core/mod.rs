pub mod device;
pub mod expr;
pub mod profile;
pub mod tuning;
