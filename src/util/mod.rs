//! URL helpers shared by the downloader, the OPML importer and the channel model.
//!
//! - **Validation**: scheme checks plus rejection of internal hosts before fetching
//! - **Asset URLs**: absolute-URL detection for channel images, favicon synthesis

mod urls;

pub use urls::{favicon_url, is_absolute_http_url, validate_url, UrlValidationError};
