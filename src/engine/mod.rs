pub mod delivery;
pub mod lifecycle;
pub mod location;
pub mod orders;
pub mod queue;
pub mod route;
