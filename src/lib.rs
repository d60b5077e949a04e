//! Bronco Controls - ESP32-S3 device backup, versioning and release manager

pub mod engine;
