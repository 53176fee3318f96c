use std::{
    net::IpAddr,
    num::{NonZeroU16, NonZeroU32},
};

use serde::Deserialize;

use crate::ServerAddr;

/// The JSON descriptor sent by the server on connect and on
/// cluster topology changes
#[derive(Debug, PartialEq, Eq, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct ServerInfo {
    #[serde(rename = "server_id")]
    pub id: String,
    #[serde(rename = "server_name")]
    pub name: String,
    pub version: String,
    #[serde(rename = "go")]
    pub go_version: String,
    pub host: IpAddr,
    pub port: NonZeroU16,
    #[serde(rename = "headers")]
    pub supports_headers: bool,
    pub max_payload: NonZeroU32,
    #[serde(rename = "proto")]
    pub protocol_version: u32,
    #[serde(default)]
    pub client_id: Option<u64>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub tls_verify: bool,
    #[serde(default)]
    pub tls_available: bool,
    #[serde(default)]
    pub connect_urls: Vec<ServerAddr>,
    #[serde(default, rename = "ldm")]
    pub lame_duck_mode: bool,
    #[serde(default)]
    pub git_commit: Option<String>,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub client_ip: Option<IpAddr>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default, rename = "cluster")]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}
