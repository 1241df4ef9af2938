#[cfg(feature = "axum")]
pub mod axum;

#[cfg(feature = "grpc")]
pub mod tonic;
