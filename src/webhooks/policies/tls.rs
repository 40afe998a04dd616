//! TLS policy
//!
//! With security on and HTTPS enabled, the nodes need a transport
//! certificate to talk to each other and an admin certificate to load the
//! security index.

use super::{ValidationContext, ValidationResult};
use crate::crd::CertificateAlias;

pub fn validate_tls(ctx: &ValidationContext) -> ValidationResult {
    let spec = &ctx.es.spec;
    if spec.disable_security || !spec.enable_ssl {
        return ValidationResult::allowed();
    }

    let Some(tls) = &spec.tls else {
        return ValidationResult::denied(
            "MissingTLSCertificates",
            "spec.tls.certificates must list the transport and admin aliases when enableSSL is set",
        );
    };

    for alias in [CertificateAlias::Transport, CertificateAlias::Admin] {
        if tls.certificate(alias).is_none() {
            return ValidationResult::denied(
                "MissingTLSCertificates",
                &format!("spec.tls.certificates is missing the {alias} alias"),
            );
        }
    }

    ValidationResult::allowed()
}
