//! A protocol-aware MySQL reverse proxy. Clients name their target cluster
//! in the user name (`<clusterID>.<realUser>`); the gateway resolves the
//! cluster to a backend address, passes authentication through untouched
//! and then relays traffic until either side closes.

pub mod config;
pub mod conn;
pub mod gateway;
pub mod protocol;
pub mod router;
pub mod session;
pub mod tls;
