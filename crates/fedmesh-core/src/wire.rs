//! fedmesh wire format — on-wire types for all fedmesh communication.
//!
//! One UDP datagram carries exactly one JSON-encoded [`Frame`]. A logical
//! [`Envelope`] maps to one frame, or to several when its payload is larger
//! than the fragment limit (see [`crate::fragment`]).
//!
//! Field names and type strings are the protocol. The misspelled
//! `"acknowlegdement"` type string is part of the deployed format and must
//! not be corrected.

use serde::{Deserialize, Serialize};

// ── Packet Type ──────────────────────────────────────────────────────────────

/// Closed set of packet types. The receiver interprets `message` and `params`
/// purely from this value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Transport-level acknowledgment of one fragment. Never reaches the
    /// coordination layer.
    #[serde(rename = "acknowlegdement")]
    Acknowledgment,

    /// A participant's encrypted contribution. Fragmented when large.
    #[serde(rename = "encryptedChunk")]
    EncryptedChunk,

    /// The aggregated ciphertext sent back to contributors. Fragmented when large.
    #[serde(rename = "result")]
    Result,

    /// Participant asks to be registered with a coordinator.
    #[serde(rename = "join")]
    Join,

    /// Coordinator hands out training hyperparameters.
    #[serde(rename = "params")]
    Parameters,

    /// Free text, no protocol meaning.
    #[default]
    #[serde(rename = "")]
    Unspecified,
}

impl PacketType {
    /// Types whose payload may exceed one datagram and therefore go through
    /// fragmentation and the acknowledgment window.
    pub fn is_chunked(self) -> bool {
        matches!(self, PacketType::EncryptedChunk | PacketType::Result)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::Acknowledgment => "acknowlegdement",
            PacketType::EncryptedChunk => "encryptedChunk",
            PacketType::Result => "result",
            PacketType::Join => "join",
            PacketType::Parameters => "params",
            PacketType::Unspecified => "",
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketType::Unspecified => f.write_str("unspecified"),
            other => f.write_str(other.as_str()),
        }
    }
}

// ── Hyperparameters ──────────────────────────────────────────────────────────

/// Activation function used by every layer of the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Sigmoid,
    Relu,
}

/// Training hyperparameters distributed by the coordinator on Join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Parameters {
    pub input_dimensions: usize,
    pub output_dimensions: usize,
    /// Number of hidden layers.
    pub nb_layers: usize,
    /// Neurons per hidden layer.
    pub nb_neurons: usize,
    pub learning_rate: f64,
    /// Global training iterations.
    pub nb_iterations: usize,
    pub activation_function: Activation,
    /// Local batch size.
    pub batch_size: usize,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            input_dimensions: 4,
            output_dimensions: 1,
            nb_layers: 1,
            nb_neurons: 5,
            learning_rate: 0.01,
            nb_iterations: 5,
            activation_function: Activation::Sigmoid,
            batch_size: 64,
        }
    }
}

impl Parameters {
    /// Check the topology against [`MAX_LAYER_WIDTH`], [`MAX_LAYERS`] and
    /// [`MAX_WEIGHTS`]. Returns the number of weights it describes.
    pub fn validate(&self) -> Result<usize, ParametersError> {
        for (field, width) in [
            ("inputDimensions", self.input_dimensions),
            ("outputDimensions", self.output_dimensions),
        ] {
            if width == 0 || width > MAX_LAYER_WIDTH {
                return Err(ParametersError::Width { field, width });
            }
        }
        if self.nb_layers > MAX_LAYERS {
            return Err(ParametersError::Layers(self.nb_layers));
        }
        if self.nb_layers > 0 && (self.nb_neurons == 0 || self.nb_neurons > MAX_LAYER_WIDTH) {
            return Err(ParametersError::Width {
                field: "nbNeurons",
                width: self.nb_neurons,
            });
        }
        if !self.learning_rate.is_finite() {
            return Err(ParametersError::LearningRate(self.learning_rate));
        }

        let count = if self.nb_layers == 0 {
            self.input_dimensions.checked_mul(self.output_dimensions)
        } else {
            let hidden = self
                .nb_neurons
                .checked_mul(self.nb_neurons)
                .and_then(|n| n.checked_mul(self.nb_layers - 1));
            self.input_dimensions
                .checked_mul(self.nb_neurons)
                .zip(hidden)
                .and_then(|(first, hidden)| first.checked_add(hidden))
                .zip(self.nb_neurons.checked_mul(self.output_dimensions))
                .and_then(|(inner, last)| inner.checked_add(last))
        };
        match count {
            Some(n) if n <= MAX_WEIGHTS => Ok(n),
            _ => Err(ParametersError::TooManyWeights),
        }
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// One logical application message, independent of how many frames carry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: String,
    pub destination: String,
    #[serde(rename = "type", default)]
    pub kind: PacketType,
    /// Opaque text: a ciphertext serialization, a plain string, or empty.
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Parameters>,
}

impl Envelope {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        kind: PacketType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            kind,
            message: message.into(),
            params: None,
        }
    }

    pub fn join(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self::new(source, destination, PacketType::Join, "")
    }

    pub fn parameters(
        source: impl Into<String>,
        destination: impl Into<String>,
        params: Parameters,
    ) -> Self {
        Self {
            params: Some(params),
            ..Self::new(source, destination, PacketType::Parameters, "")
        }
    }

    /// Wrap this envelope in a single, unfragmented frame.
    pub fn into_frame(self) -> Frame {
        Frame {
            source: self.source,
            destination: self.destination,
            kind: self.kind,
            message: self.message,
            params: self.params,
            fragment: None,
        }
    }
}

// ── Frame ────────────────────────────────────────────────────────────────────

/// Position of one frame inside a fragmented message.
///
/// `index` is zero-based; the frame with `index + 1 == count` is terminal.
/// `digest` is the hex BLAKE3 hash of the complete payload and is identical
/// on every fragment of the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentHeader {
    pub message_id: String,
    pub index: u32,
    pub count: u32,
    pub digest: String,
}

impl FragmentHeader {
    pub fn is_terminal(&self) -> bool {
        self.index + 1 >= self.count
    }
}

/// One physical datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub source: String,
    pub destination: String,
    #[serde(rename = "type", default)]
    pub kind: PacketType,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Parameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<FragmentHeader>,
}

impl Frame {
    /// Acknowledgment for `header`, addressed back to the fragment's sender.
    pub fn ack(
        source: impl Into<String>,
        destination: impl Into<String>,
        header: &FragmentHeader,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            kind: PacketType::Acknowledgment,
            message: header.index.to_string(),
            params: None,
            fragment: Some(FragmentHeader {
                message_id: header.message_id.clone(),
                index: header.index,
                count: header.count,
                digest: String::new(),
            }),
        }
    }

    /// Drop transport framing, keeping the application-level fields.
    pub fn into_envelope(self) -> Envelope {
        Envelope {
            source: self.source,
            destination: self.destination,
            kind: self.kind,
            message: self.message,
            params: self.params,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let bytes = serde_json::to_vec(self).map_err(WireError::Encode)?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(WireError::FrameTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Decode)
    }
}

// ── Constants ────────────────────────────────────────────────────────────────

/// Default maximum payload characters carried by one fragment.
pub const MAX_FRAGMENT_LEN: usize = 50_000;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// Receive buffer for a single datagram.
pub const RECV_BUFFER: usize = 65_536;

/// Widest layer accepted in [`Parameters`].
pub const MAX_LAYER_WIDTH: usize = 1 << 16;

/// Most hidden layers accepted in [`Parameters`].
pub const MAX_LAYERS: usize = 256;

/// Most weights a [`Parameters`] topology may describe (128 MiB of f64).
pub const MAX_WEIGHTS: usize = 1 << 24;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("encoded frame is {0} bytes, exceeds datagram limit {}", MAX_DATAGRAM)]
    FrameTooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParametersError {
    #[error("{field} = {width} not in 1..={}", MAX_LAYER_WIDTH)]
    Width { field: &'static str, width: usize },

    #[error("nbLayers = {0} exceeds {}", MAX_LAYERS)]
    Layers(usize),

    #[error("learningRate {0} is not finite")]
    LearningRate(f64),

    #[error("topology exceeds {} weights", MAX_WEIGHTS)]
    TooManyWeights,
}

// ── Tests ────────────────────────────────────────────────────────────────────
