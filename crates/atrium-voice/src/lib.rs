//! # Atrium Voice — real-time duplex conversation engine
//!
//! The audio core of the Atrium dashboard's assistant: microphone capture,
//! PCM16 wire framing, a realtime WebSocket session to the speech/LLM
//! endpoint, streamed transcription handling, and gapless crossfaded
//! playback — with hysteresis-based voice activity detection deciding when
//! a hands-free turn is ready to submit.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Call Session                           │
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────────┐      │
//! │  │  Capture   │──►│   Sample   │──►│     Session      │      │
//! │  │   (cpal)   │   │   Codec    │   │    Transport     │◄──┐  │
//! │  └─────┬──────┘   └────────────┘   │ (WebSocket/JSON) │   │  │
//! │        │ spectrum                  └────────┬─────────┘   │  │
//! │  ┌─────▼──────┐                    ┌────────▼─────────┐   │  │
//! │  │    VAD     │── TurnReady ──────►│ Turn State       │───┘  │
//! │  │ (60Hz tick)│                    │ Machine          │      │
//! │  └────────────┘                    └────────┬─────────┘      │
//! │        ▲ suspend while playing     ┌────────▼─────────┐      │
//! │        └───────────────────────────│ Playback         │      │
//! │                                    │ Scheduler (cpal) │      │
//! │                                    └──────────────────┘      │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is a library with no CLI surface: the embedding UI drives it
//! through [`VoiceEngine`] (`start`/`stop`/`send_text`/`toggle_call`) and
//! consumes [`EngineEvent`]s.

pub mod capture;
pub mod codec;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod sink;
pub mod spectrum;
pub mod transport;
pub mod turn;
pub mod vad;

pub use capture::{list_devices, AudioDevice, CaptureConfig, CaptureHandle, CapturePipeline};
pub use codec::{WireFrame, WireKind};
pub use error::{VoiceError, VoiceResult};
pub use playback::{AudioBuffer, OutputSink, PlaybackConfig, PlaybackScheduler, ScheduledBuffer};
pub use protocol::{ClientEvent, ServerEvent, SessionSettings, TurnDetection};
pub use session::{EngineConfig, EngineEvent, VoiceEngine};
pub use sink::{AudioOutput, SinkConfig};
pub use spectrum::{SpectrumAnalyzer, SpectrumConfig};
pub use transport::{RealtimeSession, TransportConfig};
pub use turn::{CallState, Turn, TurnRole};
pub use vad::{VadConfig, VadDetector, VadEvent};
