//! OCI artifact retrieval.
//!
//! ```text
//! job params ──► credentials ──► CredentialMap (host → user/secret)
//!                                     │
//! artifact ref ──► reference ──► pull ─┴─► registry (manifest, blobs)
//!                                 │
//!                                 └─► store (digest → bytes, verified)
//! ```
//!
//! Media types are checked against [`media_types`] before any blob is pulled.

pub mod credentials;
pub mod media_types;
mod pull;
pub mod reference;
pub mod registry;
pub mod store;

pub use credentials::{
    AadTokenSource, AcrResolver, AwsEcrTokenApi, AzureTokenSource, CredentialMap, DockerConfig,
    EcrAuthorization, EcrResolver, EcrTokenApi, GhcrResolver, RegistryCredential, RegistryKind,
    RegistryResolvers, ResolveCredentials,
};
pub use pull::{ArtifactPuller, PulledArtifact};
pub use reference::ArtifactReference;
pub use registry::{
    HostAuthenticator, OciRegistryClient, OciRegistryConnector, RegistryAuth, RegistryClient,
    RegistryConnector,
};
pub use store::ContentStore;
