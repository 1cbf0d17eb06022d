//! zipseed-storage: OpenDAL access to web seeds
//!
//! A web seed is an HTTP(S) URL serving the compressed blob. Each URL becomes
//! an OpenDAL operator rooted at the URL's origin plus the blob path inside
//! it; pieces are then fetched as byte ranges of that path.

pub mod health;
pub mod operator;
pub mod range;

pub use health::check_blob;
pub use operator::{build_http_operator, memory_operator, open_seed, SeedLocation};
pub use range::read_range;
