//! Integration tests: full sync passes against scripted sources and a
//! local HTTP server.

mod http_client;
mod mock_source;
mod pipeline;
