pub mod client;

pub use client::{MqttFrontEnd, Request, Topics};
