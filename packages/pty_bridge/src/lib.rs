//! PTY Bridge - pseudo-terminal lifecycle for one attached process
//!
//! Spawns a command inside a fresh pseudo-terminal and exposes it as an
//! actor handle (write / resize / kill) plus a single output stream. The
//! crate knows nothing about HTTP or about what is being attached to.
//!
//! # Example
//!
//! ```no_run
//! use pty_bridge::{PtyActor, PtyConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PtyConfig {
//!         command: "/bin/bash".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let (handle, mut output) = PtyActor::spawn(config).unwrap();
//!     handle.write(b"echo hello\n").await.unwrap();
//!
//!     while let Some(chunk) = output.recv().await {
//!         print!("{}", String::from_utf8_lossy(&chunk));
//!     }
//!
//!     // Closing the pty does not end the child; kill it explicitly.
//!     let _ = handle.kill().await;
//! }
//! ```

mod error;
pub mod pty;

pub use error::PtyError;
pub use pty::{PtyActor, PtyConfig, PtyHandle, PtyState, READ_BUFFER_SIZE};
