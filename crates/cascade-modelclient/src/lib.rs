//! HTTP-backed [`cascade_core::model_client::ModelClient`] implementation
//! talking to a Gemini-style Files + `generateContent` API.
//!
//! # Example
//!
//! ```no_run
//! use cascade_modelclient::GeminiModelClient;
//!
//! let client = GeminiModelClient::new()
//!     .with_api_key(std::env::var("GEMINI_API_KEY").unwrap_or_default())
//!     .with_flash_model("gemini-2.0-flash")
//!     .with_pro_model("gemini-2.0-pro");
//! ```

pub mod gemini;

pub use gemini::GeminiModelClient;
