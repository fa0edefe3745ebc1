//! HTTP session policy, JSON-Lines output and the geocoding cache for PlotPulse.

pub mod geocode;
pub mod http;
pub mod sink;

pub use geocode::{
    cache_key, full_address, GeocodeBackend, GeocodeCache, GeocodeError, Geocoder,
    NominatimBackend, DEFAULT_GEOCODER_URL, DEFAULT_GEOCODER_USER_AGENT,
};
pub use http::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpSession, HttpTransport,
    OutboundRequest, PacingPolicy, ReqwestTransport, SessionState, Sleeper, TokioSleeper,
    TransportError, USER_AGENT_POOL,
};
pub use reqwest::{header, Method, StatusCode};
pub use sink::{output_file_name, JsonlSink};

pub const CRATE_NAME: &str = "plotpulse-storage";
