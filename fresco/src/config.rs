//! Site declarations.
//!
//! A [`SiteDecl`] names the setup, the control and the control points of
//! one site. It is usually loaded from TOML:
//!
//! ```toml
//! tag = 1
//!
//! [setup]
//! type = "two-actuators-2d"
//! la0 = 120.0
//! la1 = 100.0
//! l = 50.0
//! geometry = "nonlinear"
//!
//! [control]
//! type = "simulated-springs"
//! stiffness = [1230.0, 800.0]
//!
//! [[ctrl_points]]
//! node = 1
//! direction = "x"
//! response = "disp"
//! lower = -0.05
//! upper = 0.05
//! ```
//!
//! [`SiteDecl::build`] validates the declaration and assembles the site.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{ControlPointCatalog, Direction, Limits};
use crate::control::{ExecMode, ExperimentalControl, LocalControl, RemoteControl, SimulatedSprings};
use crate::error::Result;
use crate::net::{Endpoint, PollingChannel, Role, StreamChannel};
use crate::protocol::DEFAULT_PAYLOAD_CAP;
use crate::response::{ResponseType, SizeVector};
use crate::session::{Session, SessionConfig};
use crate::setup::{ActuatorSide, ExperimentalSetup, Geometry, NoTransformation, TwoActuators2d};
use crate::site::{LocalSite, SiteBackend};
use crate::trace::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse site declaration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid site declaration: {0}")]
    Invalid(String),
}

/// One site: setup, control and control points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteDecl {
    pub tag: u32,
    /// Without a setup the control is driven with trial vectors directly.
    #[serde(default)]
    pub setup: Option<SetupDecl>,
    pub control: ControlDecl,
    #[serde(default)]
    pub ctrl_points: Vec<ControlPointDecl>,
    #[serde(default)]
    pub daq_points: Vec<ControlPointDecl>,
    #[serde(default)]
    pub trial_factors: BTreeMap<ResponseType, f64>,
    #[serde(default)]
    pub out_factors: BTreeMap<ResponseType, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SetupDecl {
    /// Identity. Sizes default to the counts of the declared control points.
    NoTransformation {
        #[serde(default)]
        ctrl: Option<[usize; ResponseType::COUNT]>,
        #[serde(default)]
        daq: Option<[usize; ResponseType::COUNT]>,
    },
    #[serde(rename = "two-actuators-2d")]
    TwoActuators2d {
        la0: f64,
        la1: f64,
        l: f64,
        #[serde(default)]
        geometry: Geometry,
        #[serde(default)]
        side: ActuatorSide,
        #[serde(default)]
        phi_loc_x: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlDecl {
    SimulatedSprings {
        stiffness: Vec<f64>,
        #[serde(default)]
        pending_polls: usize,
        #[serde(default)]
        mode: ModeDecl,
    },
    /// A control-only actor reached over TCP.
    Remote {
        address: String,
        /// Tag announced to the actor; defaults to the site tag.
        #[serde(default)]
        tag: Option<u32>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default = "default_payload_cap")]
        payload_cap: usize,
        #[serde(default)]
        transport: TransportDecl,
    },
}

/// How a remote control talks to its actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportDecl {
    /// Blocking TCP stream.
    #[default]
    Stream,
    /// Non-blocking mio stream.
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ModeDecl {
    #[default]
    Blocking,
    Polling { interval_ms: u64, timeout_ms: u64 },
}

impl From<ModeDecl> for ExecMode {
    fn from(mode: ModeDecl) -> Self {
        match mode {
            ModeDecl::Blocking => Self::Blocking,
            ModeDecl::Polling {
                interval_ms,
                timeout_ms,
            } => Self::Polling {
                interval: Duration::from_millis(interval_ms),
                timeout: Duration::from_millis(timeout_ms),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlPointDecl {
    pub node: u32,
    pub direction: Direction,
    pub response: ResponseType,
    #[serde(default = "unit_factor")]
    pub factor: f64,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
}

const fn unit_factor() -> f64 {
    1.0
}

const fn default_payload_cap() -> usize {
    DEFAULT_PAYLOAD_CAP
}

impl SiteDecl {
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown types.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Assembles the site. A remote control connects here.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for inconsistent declarations, the
    /// catalog or geometry error for bad values, and a connection error if
    /// a remote control cannot be reached.
    pub fn build(&self) -> Result<LocalSite> {
        let ctrl_points = catalog(&self.ctrl_points)?;
        let daq_points = catalog(&self.daq_points)?;

        let Some(setup) = &self.setup else {
            if !(ctrl_points.is_empty()
                && daq_points.is_empty()
                && self.trial_factors.is_empty()
                && self.out_factors.is_empty())
            {
                return Err(invalid("control points and factors need a setup"));
            }
            let control = self.control.build(self.tag)?;
            info!(tag = self.tag, "site built without setup");
            return Ok(LocalSite::new(self.tag, SiteBackend::Control(control)));
        };

        let mut built = match *setup {
            SetupDecl::NoTransformation { ctrl, daq } => {
                let ctrl = ctrl.map_or(ctrl_points.sizes(), SizeVector::new);
                let daq = daq.map_or(daq_points.sizes(), SizeVector::new);
                if ctrl.is_zero() {
                    return Err(invalid("no-transformation needs ctrl sizes or ctrl points"));
                }
                ExperimentalSetup::new(NoTransformation::new(ctrl, daq))
            }
            SetupDecl::TwoActuators2d {
                la0,
                la1,
                l,
                geometry,
                side,
                phi_loc_x,
            } => ExperimentalSetup::new(TwoActuators2d::new(la0, la1, l, geometry, side, phi_loc_x)?),
        };
        built = built.with_ctrl_points(ctrl_points)?.with_daq_points(daq_points)?;
        for (&ty, &factor) in &self.trial_factors {
            built = built.with_trial_factor(ty, factor)?;
        }
        for (&ty, &factor) in &self.out_factors {
            built = built.with_out_factor(ty, factor)?;
        }
        let control = self.control.build(self.tag)?;
        info!(
            tag = self.tag,
            transformation = built.transformation().name(),
            "site built"
        );
        Ok(LocalSite::new(self.tag, SiteBackend::Setup(built.with_control(control))))
    }
}

impl ControlDecl {
    /// # Errors
    ///
    /// Fails for invalid values or if a remote actor cannot be reached.
    pub fn build(&self, site_tag: u32) -> Result<Box<dyn ExperimentalControl>> {
        match self {
            Self::SimulatedSprings {
                stiffness,
                pending_polls,
                mode,
            } => {
                if stiffness.is_empty() || stiffness.iter().any(|k| !k.is_finite()) {
                    return Err(invalid("simulated springs need finite stiffnesses"));
                }
                let springs = SimulatedSprings::new(stiffness.clone()).with_pending_polls(*pending_polls);
                Ok(Box::new(LocalControl::new(springs, (*mode).into())))
            }
            Self::Remote {
                address,
                tag,
                timeout_ms,
                payload_cap,
                transport,
            } => {
                let endpoint: Endpoint = address
                    .parse()
                    .map_err(|_| invalid(&format!("bad remote address {address:?}")))?;
                let config = SessionConfig {
                    payload_cap: *payload_cap,
                    receive_timeout: timeout_ms.map(Duration::from_millis),
                };
                let tag = tag.unwrap_or(site_tag);
                Ok(match transport {
                    TransportDecl::Stream => {
                        let channel = StreamChannel::connect(endpoint)?;
                        Box::new(RemoteControl::new(Session::new(channel, &config)?, tag))
                    }
                    TransportDecl::Polling => {
                        let channel = PollingChannel::open(Role::Client, endpoint)?;
                        Box::new(RemoteControl::new(Session::new(channel, &config)?, tag))
                    }
                })
            }
        }
    }
}

fn catalog(points: &[ControlPointDecl]) -> Result<ControlPointCatalog> {
    let mut catalog = ControlPointCatalog::new();
    for p in points {
        let limits = match (p.lower, p.upper) {
            (None, None) => None,
            (Some(lower), Some(upper)) => Some(Limits::new(lower, upper)?),
            _ => {
                return Err(invalid(&format!(
                    "node {} {} {} needs both lower and upper limits",
                    p.node, p.direction, p.response
                )));
            }
        };
        catalog.declare(p.node, p.direction, p.response, p.factor, limits)?;
    }
    Ok(catalog)
}

fn invalid(reason: &str) -> crate::Error {
    ConfigError::Invalid(reason.to_owned()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::control::SessionState;
    use crate::site::ExperimentalSite;

    const SPRINGS: &str = r#"
        tag = 4

        [setup]
        type = "no-transformation"

        [control]
        type = "simulated-springs"
        stiffness = [1230.0]

        [[ctrl_points]]
        node = 1
        direction = "x"
        response = "disp"
        lower = -1.0
        upper = 1.0

        [[ctrl_points]]
        node = 1
        direction = "x"
        response = "force"

        [[daq_points]]
        node = 1
        direction = "x"
        response = "disp"

        [[daq_points]]
        node = 1
        direction = "x"
        response = "force"
    "#;

    #[test]
    fn parses_and_builds_a_springs_site() {
        let decl = SiteDecl::from_toml_str(SPRINGS).unwrap();
        assert_eq!(decl.tag, 4);
        assert_eq!(decl.ctrl_points.len(), 2);
        assert_eq!(decl.ctrl_points[0].lower, Some(-1.0));

        let mut site = decl.build().unwrap();
        let sizes = SizeVector::new([1, 0, 0, 1, 0]);
        site.set_size(sizes, sizes).unwrap();
        assert_eq!(site.control_state(), Some(SessionState::Ready));
    }

    #[test]
    fn parses_two_actuators_with_polling_mode() {
        let decl = SiteDecl::from_toml_str(
            r#"
            tag = 2

            [setup]
            type = "two-actuators-2d"
            la0 = 120.0
            la1 = 100.0
            l = 50.0
            geometry = "nonlinear"
            side = "right"
            phi_loc_x = 90.0

            [control]
            type = "simulated-springs"
            stiffness = [10.0, 20.0]
            pending_polls = 2
            mode = { kind = "polling", interval_ms = 1, timeout_ms = 500 }

            [trial_factors]
            disp = 2.0
            "#,
        )
        .unwrap();
        assert!(matches!(
            decl.setup,
            Some(SetupDecl::TwoActuators2d {
                geometry: Geometry::Nonlinear,
                side: ActuatorSide::Right,
                ..
            })
        ));
        assert_eq!(decl.trial_factors.get(&ResponseType::Disp), Some(&2.0));
        let ControlDecl::SimulatedSprings { mode, .. } = decl.control else {
            panic!("expected springs");
        };
        assert_eq!(
            ExecMode::from(mode),
            ExecMode::Polling {
                interval: Duration::from_millis(1),
                timeout: Duration::from_millis(500),
            }
        );
        assert!(decl.build().is_ok());
    }

    #[test]
    fn unknown_types_fail_to_parse() {
        let err = SiteDecl::from_toml_str(
            r#"
            tag = 1
            [control]
            type = "hydraulic-ram"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn remote_control_defaults() {
        let decl = SiteDecl::from_toml_str(
            r#"
            tag = 2

            [control]
            type = "remote"
            address = "127.0.0.1:8090"
            "#,
        )
        .unwrap();
        assert_eq!(
            decl.control,
            ControlDecl::Remote {
                address: "127.0.0.1:8090".to_owned(),
                tag: None,
                timeout_ms: None,
                payload_cap: DEFAULT_PAYLOAD_CAP,
                transport: TransportDecl::Stream,
            }
        );
    }

    #[test]
    fn bad_remote_address_is_invalid() {
        let decl = SiteDecl::from_toml_str(
            r#"
            tag = 2

            [control]
            type = "remote"
            address = "not an address"
            transport = "polling"
            "#,
        )
        .unwrap();
        assert!(matches!(
            decl.build(),
            Err(Error::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn half_open_limits_are_rejected() {
        let decl = SiteDecl::from_toml_str(
            r#"
            tag = 1
            [setup]
            type = "no-transformation"
            [control]
            type = "simulated-springs"
            stiffness = [1.0]
            [[ctrl_points]]
            node = 1
            direction = "x"
            response = "disp"
            lower = -1.0
            "#,
        )
        .unwrap();
        assert!(matches!(
            decl.build(),
            Err(Error::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn points_without_setup_are_rejected() {
        let decl = SiteDecl::from_toml_str(
            r#"
            tag = 1
            [control]
            type = "simulated-springs"
            stiffness = [1.0]
            [[daq_points]]
            node = 1
            direction = "x"
            response = "force"
            "#,
        )
        .unwrap();
        assert!(matches!(
            decl.build(),
            Err(Error::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = SiteDecl::load("/nonexistent/site.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { ref path, .. } if path.ends_with("site.toml")));
    }
}
