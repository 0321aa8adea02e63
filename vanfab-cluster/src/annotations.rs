//! Annotation vocabulary written and read on cluster objects.

/// Marks an object as owned by this controller; pruning only ever touches
/// objects carrying `controlled=true`.
pub const ANNOTATION_CONTROLLED: &str = "controlled";

/// State directory tag; only `remote` is emitted.
pub const ANNOTATION_STATE_DIR: &str = "state-dir";

/// State key advertised for this object over the sync protocol.
pub const ANNOTATION_STATE_KEY: &str = "state-key";

/// Content hash matching the advertised state key.
pub const ANNOTATION_STATE_HASH: &str = "state-hash";

/// `link` or `accesspoint`.
pub const ANNOTATION_STATE_TYPE: &str = "state-type";

/// Database id of the row behind `state-type`.
pub const ANNOTATION_STATE_ID: &str = "state-id";

/// TLS injection target: `site` or `accesspoint`.
pub const ANNOTATION_TLS_INJECT: &str = "tls-inject";

/// Id of the owning `certificate_requests` row; finalization resolves
/// requests by this annotation on arriving secrets.
pub const ANNOTATION_DBLINK: &str = "skx-dblink";

/// Id of the parent `tls_certificates` row, or the literal `root` for the
/// external root issuer.
pub const ANNOTATION_ISSUERLINK: &str = "skx-issuerlink";

/// Sentinel issuer value naming the external root.
pub const ISSUER_ROOT: &str = "root";
