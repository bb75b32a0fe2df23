pub mod authorization;
pub mod batch;
pub mod confirmation;
pub mod registry;
pub mod transfer;
