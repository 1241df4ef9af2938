//! 出站 REST 与 SOAP 客户端

mod rest;
mod soap;

pub use rest::{is_health_check, RestClient, RestClientOptions, RestRequest, RestResponse};
pub use soap::{body_content, envelope, fault, resolve_address, SoapClient, SoapClients};
