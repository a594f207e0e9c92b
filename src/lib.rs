//! VPN fleet control plane
//!
//! The panel owns authoritative state for subscribers, worker nodes and
//! their service definitions; builds per-node forwarding-engine
//! configurations; drives workers over a mutually-authenticated REST
//! channel; aggregates traffic into hourly buckets for quota enforcement;
//! and renders subscriber credentials into client-consumable formats.
//!
//! # Architecture
//!
//! | Component | Module | Responsibility |
//! |-----------|--------|----------------|
//! | Store | [`store`] | Typed CRUD over the panel database |
//! | PKI | [`pki`] | Fleet CA, node server / panel client certificates |
//! | ConfigBuilder | [`engine_config`] | Pure `(node, users, services) → config` |
//! | NodeClient | [`node_client`] | Per-node mTLS REST session, stats, logs |
//! | NodeRegistry | [`registry`] | Process-wide `node_id → client` map |
//! | Operations | [`ops`] | Connect / restart / activate / deactivate flows |
//! | Scheduler | [`scheduler`] | Named periodic jobs with coalescing |
//! | UsagePipeline | [`usage`] | Collect → attribute → persist → review |
//! | Subscription | [`subscription`] | Link rendering per client format |
//! | HTTP adapter | [`http`] | Thin axum boundary over the core |
//!
//! Data flows one way: API requests mutate the [`store::Store`], then
//! enqueue an [`ops::Operations`] task; operations read the store, build a
//! config and instruct the [`node_client::NodeClient`]; the
//! [`scheduler::Scheduler`] drives the same entry points on its own
//! cadence. After any successful operation, the running config on every
//! connected node equals the builder's output for the current snapshot.
//!
//! # Quick start
//!
//! ```no_run
//! use vpn_panel::core::Core;
//! use vpn_panel::settings::Settings;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let core = Core::start(Settings::from_env()).await?;
//! let router = vpn_panel::http::router(std::sync::Arc::new(core));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//! axum::serve(listener, router).await?;
//! # Ok(())
//! # }
//! ```

pub mod bandwidth;
pub mod core;
pub mod engine_config;
pub mod error;
pub mod http;
pub mod models;
pub mod node_client;
pub mod ops;
pub mod pki;
pub mod registry;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod subscription;
pub mod token;
pub mod usage;

pub use engine_config::{build_engine_config, ActiveUser, EngineConfig};
pub use error::{PanelError, Result};
pub use models::{
    Admin, NetworkType, Node, NodeStatus, ProtocolType, Proxy, ProxySettings, SecurityType,
    ServiceConfiguration, User, UserStatus,
};
pub use node_client::{NodeClient, NodeClientBuilder};
pub use ops::Operations;
pub use pki::Pki;
pub use registry::NodeRegistry;
pub use settings::Settings;
pub use store::Store;
pub use token::TokenService;
