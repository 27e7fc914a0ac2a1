//! API handlers for the FlightSurety server

pub mod flights;
pub mod oracle;

pub use flights::{get_service_info, list_flights};
pub use oracle::get_request_index;
