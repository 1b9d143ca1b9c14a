//! HTTP/1.x wire protocol pieces.

pub(crate) mod chunked;
pub(crate) mod parse;
pub(crate) mod payload;
