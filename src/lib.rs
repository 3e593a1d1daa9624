//! segbridge - drive a segmentation model in a long-lived worker process.
//!
//! The host process never imports the model. It spawns a Python worker,
//! sends it generated scripts over a JSON-lines pipe, moves images and
//! label maps through shared memory, and turns the returned contour lists
//! into polygons.
//!
//! ```no_run
//! use ndarray::{ArrayD, IxDyn};
//! use segbridge::array::NdArray;
//! use segbridge::bridge::EnvironmentDescriptor;
//! use segbridge::config::SessionConfig;
//! use segbridge::manager::initialize_session;
//! use segbridge::script::ModelSpec;
//!
//! # fn main() -> segbridge::error::Result<()> {
//! let env = EnvironmentDescriptor::new("/opt/envs/sam", true);
//! let model = ModelSpec::sam("vit_b", "/opt/models/sam_vit_b_01ec64.pth");
//! let image = NdArray::from(ArrayD::<u8>::zeros(IxDyn(&[480, 640, 3])));
//!
//! let mut session = initialize_session(&env, &model, SessionConfig::default(), &image)?;
//! let polygons = session.process_box([100, 120, 300, 360])?;
//! println!("{} polygons", polygons.len());
//! session.close()?;
//! # Ok(())
//! # }
//! ```

pub mod array;
pub mod bridge;
pub mod channel;
pub mod cli;
pub mod config;
pub mod contour;
pub mod error;
pub mod geometry;
pub mod logging;
pub mod manager;
pub mod output;
pub mod paths;
pub mod script;
pub mod theme;

pub use error::{BridgeError, Result};
pub use manager::{SessionManager, initialize_session};
