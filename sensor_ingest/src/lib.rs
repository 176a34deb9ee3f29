//! Sensor-side building blocks: data models, the CSV row codec, the remote node
//! client, the device-driver boundary and clock-offset estimation.

pub mod clock;
pub mod driver;
pub mod errors;
pub mod io;
pub mod models;
pub mod remote;
