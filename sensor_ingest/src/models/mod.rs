pub mod api;
pub mod manifest;
pub mod reading;
pub mod session;
