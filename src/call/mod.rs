//! Call identities and fingerprints

mod digest;
mod id;
mod literal;

pub use digest::{merge_extra_digests, Digest, DigestHasher, ExtraDigest, CONTENT_LABEL};
pub use id::{Argument, CallId};
pub use literal::Literal;
