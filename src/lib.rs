// mesh-bus: Library entry point.
//
// A cross-context message bus: peers exchange signals, request/response
// calls and chunked byte streams over interchangeable transports.  The
// `MessageBus` facade composes the pieces; the modules are public for
// integration testing and for embedders that only need one subsystem.

pub mod bus;
pub mod clock;
pub mod config;
pub mod emitter;
pub mod error;
pub mod handshake;
pub mod hooks;
pub mod origin;
pub mod pending;
pub mod presence;
pub mod router;
pub mod stream;
pub mod transport;
pub mod util;

pub use bus::{
    BroadcastRequestOptions, DiagnosticsReport, HandlerContext, HandlerGuard, HandlerOptions,
    HealthReport, MessageBus, PeerResponse, RequestOptions, SignalOptions, TransportGuard,
};
pub use clock::{CausalOrderer, VectorClock};
pub use config::BusOptions;
pub use emitter::{DispatchMode, EventEmitter, Handler, ListenOptions, SignalEvent, Subscription};
pub use error::{BusError, BusResult, ErrorKind};
pub use handshake::{HandshakeValidator, PeerInfo};
pub use hooks::{Direction, HookContext, HookFn, HookHandle, MessageClass, hook};
pub use origin::OriginValidator;
pub use presence::PresenceConfig;
pub use router::{
    BroadcastOptions, PeerConfig, PeerKind, PeerSnapshot, PeerStatus, RouteOutcome, SendFn, send_fn,
};
pub use stream::{Chunk, IncomingStream, StreamWriter};
pub use transport::{Transport, TransportMessage, TransportOptions};

// Wire types are re-exported so embedders rarely need mb-protocol directly.
pub use mb_protocol as protocol;
