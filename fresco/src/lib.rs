//! Experimental-site protocol layer for hybrid simulation.
//!
//! A finite-element element hands trial vectors to an
//! [`ExperimentalSite`]. The site runs them through an
//! [`ExperimentalSetup`] to actuator commands and drives an
//! [`ExperimentalControl`], possibly on another machine through a
//! [`ShadowSite`]/[`Actor`] pair.

pub mod actor;
pub mod catalog;
pub mod config;
pub mod control;
pub mod error;
pub mod net;
pub mod protocol;
pub mod response;
pub mod session;
pub mod setup;
pub mod site;

mod trace;

pub use actor::{Actor, ActorConfig, ActorExit};
pub use control::{ExecMode, ExperimentalControl, LocalControl, RemoteControl};
pub use error::{Error, Result};
pub use response::{MatrixKind, Response, ResponseType, SizeVector};
pub use session::{Session, SessionConfig};
pub use setup::{ExperimentalSetup, Transformation};
pub use site::{ExperimentalSite, LocalSite, ShadowConfig, ShadowSite, SiteBackend};
pub use trace::init_tracing;
