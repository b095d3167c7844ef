pub mod client;
pub mod dialog;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transcribe;
