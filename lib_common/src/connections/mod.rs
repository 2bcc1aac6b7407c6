//! # Connections Module
//!
//! This module handles persistent connections to external services.
//! Currently that is the MQTT broker the displays talk through.

/// MQTT session, publisher and presence subscription.
pub mod mqtt_broker;
