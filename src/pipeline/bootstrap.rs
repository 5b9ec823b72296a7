//! Connection bootstrap
//!
//! Runs synchronously on a fresh socket before the pipeline starts
//! multiplexing on it: HELLO feature negotiation, SASL PLAIN, bucket
//! selection and error map retrieval. Authentication and bucket selection
//! failures are fatal for the pipeline; anything else is a transient
//! connection failure and the pipeline reconnects.

use std::io::{BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::config::Config;
use crate::error::{MemdError, Result};
use crate::protocol::{read_packet, write_packet, HelloFeature, Opcode, Packet};
use crate::status::{ErrorMap, StatusCode, Translator, ERROR_MAP_VERSION};

/// Features the server agreed to during HELLO
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    features: Vec<HelloFeature>,

    /// An error map was fetched and installed
    pub error_map: bool,
}

impl Capabilities {
    pub fn from_features(features: Vec<HelloFeature>) -> Self {
        Self {
            features,
            error_map: false,
        }
    }

    pub fn has(&self, feature: HelloFeature) -> bool {
        self.features.contains(&feature)
    }

    pub fn features(&self) -> &[HelloFeature] {
        &self.features
    }

    /// Mutation responses carry vbuuid + seqno
    pub fn mutation_tokens(&self) -> bool {
        self.has(HelloFeature::SeqNo)
    }

    pub fn enhanced_errors(&self) -> bool {
        self.has(HelloFeature::Xerror)
    }

    pub fn xattr(&self) -> bool {
        self.has(HelloFeature::Xattr)
    }

    pub fn json(&self) -> bool {
        self.has(HelloFeature::Json)
    }

    pub fn select_bucket(&self) -> bool {
        self.has(HelloFeature::SelectBucket)
    }
}

/// Features to request, derived from the config toggles
pub fn requested_features(config: &Config) -> Vec<HelloFeature> {
    let mut features = Vec::new();
    if config.tcp_nodelay {
        features.push(HelloFeature::TcpNoDelay);
    }
    if config.use_mutation_tokens {
        features.push(HelloFeature::SeqNo);
    }
    if config.use_xattr {
        features.push(HelloFeature::Xattr);
    }
    if config.use_enhanced_errors || config.use_kv_error_maps {
        features.push(HelloFeature::Xerror);
    }
    if config.use_json {
        features.push(HelloFeature::Json);
    }
    features.push(HelloFeature::SelectBucket);
    features
}

/// Encode a HELLO request
pub fn hello_request(client_name: &str, features: &[HelloFeature]) -> Packet {
    let mut value = BytesMut::with_capacity(features.len() * 2);
    for feature in features {
        value.put_u16(feature.code());
    }
    Packet::request(Opcode::Hello)
        .with_key(client_name.as_bytes().to_vec())
        .with_value(value.freeze())
}

/// Decode the feature list of a HELLO response
pub fn parse_hello_response(packet: &Packet) -> Result<Vec<HelloFeature>> {
    if packet.value.len() % 2 != 0 {
        return Err(MemdError::Protocol(format!(
            "HELLO response value has odd length {}",
            packet.value.len()
        )));
    }
    Ok(packet
        .value
        .chunks_exact(2)
        .map(|pair| HelloFeature::from(u16::from_be_bytes([pair[0], pair[1]])))
        .collect())
}

/// Encode a SASL PLAIN auth request (`\0user\0password`)
pub fn sasl_plain_request(username: &str, password: &str) -> Packet {
    let mut value = BytesMut::with_capacity(username.len() + password.len() + 2);
    value.put_u8(0);
    value.put_slice(username.as_bytes());
    value.put_u8(0);
    value.put_slice(password.as_bytes());
    Packet::request(Opcode::SaslAuth)
        .with_key(&b"PLAIN"[..])
        .with_value(value.freeze())
}

/// One blocking request/response exchange on the bootstrap socket
struct Exchange<'a> {
    reader: BufReader<&'a TcpStream>,
    writer: BufWriter<&'a TcpStream>,
    next_opaque: u32,
}

impl<'a> Exchange<'a> {
    fn new(stream: &'a TcpStream) -> Self {
        Self {
            reader: BufReader::new(stream),
            writer: BufWriter::new(stream),
            next_opaque: 0xB007_0000,
        }
    }

    fn call(&mut self, mut request: Packet) -> Result<Packet> {
        self.next_opaque = self.next_opaque.wrapping_add(1);
        request.opaque = self.next_opaque;
        write_packet(&mut self.writer, &request)?;
        self.writer.flush()?;

        let response = read_packet(&mut self.reader)?;
        if response.opaque != request.opaque || response.opcode != request.opcode {
            return Err(MemdError::Protocol(format!(
                "unexpected {:?} response (opaque {}) during bootstrap",
                response.opcode, response.opaque
            )));
        }
        Ok(response)
    }
}

/// Bootstrap a freshly connected socket
///
/// The socket's read timeout must already be set; it bounds every exchange.
pub fn bootstrap(
    stream: &TcpStream,
    address: &str,
    config: &Config,
    translator: &Arc<Translator>,
) -> Result<Capabilities> {
    let mut exchange = Exchange::new(stream);

    // ---- HELLO ----
    let requested = requested_features(config);
    let response = exchange.call(hello_request(&config.client_name, &requested))?;
    let mut capabilities = match response.status {
        StatusCode::Success => Capabilities::from_features(parse_hello_response(&response)?),
        StatusCode::UnknownCommand | StatusCode::NotSupported => Capabilities::default(),
        other => {
            return Err(MemdError::Protocol(format!(
                "HELLO failed with status {:?}",
                other
            )))
        }
    };
    tracing::debug!(
        "Negotiated features with {}: {:?}",
        address,
        capabilities.features()
    );

    // ---- SASL ----
    if let Some(auth) = &config.auth {
        let credentials = auth.credentials(address);
        let response =
            exchange.call(sasl_plain_request(&credentials.username, &credentials.password))?;
        match response.status {
            StatusCode::Success => {
                tracing::debug!("Authenticated to {} as {}", address, credentials.username)
            }
            StatusCode::AuthContinue => {
                return Err(MemdError::Auth(format!(
                    "{} requested a multi-step SASL exchange",
                    address
                )))
            }
            status => {
                return Err(MemdError::Auth(format!(
                    "{} rejected credentials for {} ({:?})",
                    address, credentials.username, status
                )))
            }
        }
    }

    // ---- Select bucket ----
    if capabilities.select_bucket() {
        let request =
            Packet::request(Opcode::SelectBucket).with_key(config.bucket_name.as_bytes().to_vec());
        let response = exchange.call(request)?;
        if !response.is_success() {
            return Err(MemdError::Auth(format!(
                "cannot select bucket {} on {} ({:?})",
                config.bucket_name, address, response.status
            )));
        }
    }

    // ---- Error map ----
    if config.use_kv_error_maps && capabilities.enhanced_errors() {
        let request = Packet::request(Opcode::GetErrorMap)
            .with_value(ERROR_MAP_VERSION.to_be_bytes().to_vec());
        let response = exchange.call(request)?;
        if response.is_success() {
            match ErrorMap::parse(&response.value) {
                Ok(map) => {
                    translator.install_error_map(Arc::new(map));
                    capabilities.error_map = true;
                }
                Err(e) => tracing::warn!("Ignoring unparsable error map from {}: {}", address, e),
            }
        } else {
            tracing::debug!(
                "{} has no error map ({:?})",
                address,
                response.status
            );
        }
    }

    Ok(capabilities)
}
