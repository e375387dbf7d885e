pub mod combine;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod reasoning;
pub mod safety;
pub mod session;
pub mod simulation;
pub mod stream;

mod util;
