pub mod cook;
pub mod driver;
pub mod order;
pub mod route;
pub mod tracking;
