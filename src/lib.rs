mod api;
mod controller;
mod error;
mod logger;
mod protocol;
mod types;

pub use api::ApiClient;
pub use controller::{Thermostat, ThermostatBuilder, ThermostatHandle};
pub use error::{Error, Result};
pub use types::*;
