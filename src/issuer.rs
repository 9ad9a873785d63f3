//! Certificate issuer.
//!
//! A certificate record is the durable fact; the QR payload render and the
//! PDF are derived artifacts produced by an external render service. Artifact
//! failures never undo issuance. They are reported to the caller and filled
//! in lazily the next time the certificate is read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::eligibility;
use crate::error::{LmsError, LmsResult};
use crate::models::*;
use crate::store::{Store, StoreError, CERT_USER_SCOPE_KEY};

const PATH_SEGMENT: &AsciiSet = &CONTROLS.add(b' ').add(b'/').add(b'?').add(b'#').add(b'%');

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("render service not configured")]
    Disabled,
    #[error("render service returned status {0}")]
    Status(u16),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// What the document renderer needs to lay out a certificate.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateDocument {
    pub certificate_number: String,
    pub holder_name: String,
    pub holder_email: String,
    pub title: String,
    pub score: f64,
    pub issued_at: DateTime<Utc>,
    pub issuer_name: String,
    pub verification_url: String,
}

#[async_trait]
pub trait ArtifactRenderer: Send + Sync {
    /// PNG QR code encoding `payload`.
    async fn render_qr(&self, payload: &str) -> Result<Vec<u8>, ArtifactError>;
    /// PDF certificate.
    async fn render_document(&self, doc: &CertificateDocument) -> Result<Vec<u8>, ArtifactError>;
}

/// Client for the render service at `RENDER_SERVICE_URL`.
pub struct HttpRenderer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRenderer {
    /// `timeout` bounds both connecting and the whole request, so a stalled
    /// render service cannot hold a submit open.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ArtifactError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string() })
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<Vec<u8>, ArtifactError> {
        let resp = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ArtifactError::Status(resp.status().as_u16()));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl ArtifactRenderer for HttpRenderer {
    async fn render_qr(&self, payload: &str) -> Result<Vec<u8>, ArtifactError> {
        self.post("qr", &serde_json::json!({ "payload": payload })).await
    }

    async fn render_document(&self, doc: &CertificateDocument) -> Result<Vec<u8>, ArtifactError> {
        self.post("certificate", doc).await
    }
}

/// Used when no render service is configured.
pub struct DisabledRenderer;

#[async_trait]
impl ArtifactRenderer for DisabledRenderer {
    async fn render_qr(&self, _payload: &str) -> Result<Vec<u8>, ArtifactError> {
        Err(ArtifactError::Disabled)
    }

    async fn render_document(&self, _doc: &CertificateDocument) -> Result<Vec<u8>, ArtifactError> {
        Err(ArtifactError::Disabled)
    }
}

fn scope_tag(scope: CertificateScope) -> &'static str {
    match scope {
        CertificateScope::Course(_) => "CRS",
        CertificateScope::Module(_) => "MOD",
        CertificateScope::Program => "PRG",
    }
}

/// `<prefix>-<tag>-<12 hex digits>`, 48 random bits per scope tag.
pub fn certificate_number<R: Rng + ?Sized>(prefix: &str, scope: CertificateScope, rng: &mut R) -> String {
    let token: u64 = rng.gen::<u64>() >> 16;
    format!("{}-{}-{:012X}", prefix, scope_tag(scope), token)
}

pub fn verification_url(base_url: &str, number: &str) -> String {
    format!(
        "{}/certificates/verify/{}",
        base_url.trim_end_matches('/'),
        utf8_percent_encode(number, PATH_SEGMENT)
    )
}

/// Text encoded in the QR code; readable without a lookup.
pub fn verification_payload(doc: &CertificateDocument) -> String {
    format!(
        "CERTIFICATE OF COMPLETION\n\
         Certificate #: {}\n\
         Full Name: {}\n\
         Email: {}\n\
         Course: {}\n\
         Final Score: {:.1}%\n\
         Completed: {}\n\
         Issued by: {}\n\
         Verification: {}",
        doc.certificate_number,
        doc.holder_name,
        doc.holder_email,
        doc.title,
        doc.score,
        doc.issued_at.format("%B %d, %Y"),
        doc.issuer_name,
        doc.verification_url,
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct IssueOutcome {
    pub certificate: Certificate,
    /// `false` when an existing certificate was returned.
    pub created: bool,
    pub artifact_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub valid: bool,
    pub certificate_number: String,
    pub holder_name: Option<String>,
    pub title: Option<String>,
    pub score: Option<f64>,
    pub issued_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CertificateDetail {
    pub certificate: Certificate,
    pub title: String,
    pub has_document: bool,
    pub artifact_error: Option<String>,
}

pub struct Issuer {
    store: Arc<dyn Store>,
    renderer: Arc<dyn ArtifactRenderer>,
    base_url: String,
    prefix: String,
    issuer_name: String,
    program_title: String,
}

impl Issuer {
    pub fn new(store: Arc<dyn Store>, renderer: Arc<dyn ArtifactRenderer>, config: &Config) -> Self {
        Self {
            store,
            renderer,
            base_url: config.base_url.clone(),
            prefix: config.cert_prefix.clone(),
            issuer_name: config.issuer_name.clone(),
            program_title: config.program_title.clone(),
        }
    }

    /// Issues a certificate for (user, scope), or returns the one that
    /// already exists.
    pub async fn issue(&self, user_id: Uuid, scope: CertificateScope, score: f64) -> LmsResult<IssueOutcome> {
        if let Some(existing) = self.store.find_certificate(user_id, scope).await? {
            return Ok(self.settle(existing, false).await);
        }

        let number = certificate_number(&self.prefix, scope, &mut rand::thread_rng());
        let cert = Certificate {
            id: Uuid::new_v4(),
            user_id,
            scope,
            verification_url: verification_url(&self.base_url, &number),
            certificate_number: number,
            score,
            qr_code: None,
            document: None,
            is_valid: true,
            issued_at: Utc::now(),
        };

        match self.store.insert_certificate(&cert).await {
            Ok(()) => {}
            Err(e) if e.is_duplicate_of(CERT_USER_SCOPE_KEY) => {
                // a concurrent request won the race; hand back its record
                let winner = self
                    .store
                    .find_certificate(user_id, scope)
                    .await?
                    .ok_or(LmsError::DuplicateIssuance)?;
                tracing::info!(user_id = %user_id, number = %winner.certificate_number, "certificate already issued");
                return Ok(self.settle(winner, false).await);
            }
            Err(e) => {
                if let StoreError::Duplicate { constraint } = &e {
                    tracing::error!(number = %cert.certificate_number, %constraint, "certificate number collision");
                }
                return Err(e.into());
            }
        }

        tracing::info!(user_id = %user_id, scope = scope.kind(), number = %cert.certificate_number, score, "certificate issued");
        Ok(self.settle(cert, true).await)
    }

    /// Follow-up work for a stored certificate: the enrollment completion
    /// mark and the artifacts. Both are retried on every later issue call for
    /// the same scope, so failures here are reported, never returned.
    async fn settle(&self, cert: Certificate, created: bool) -> IssueOutcome {
        let mut problems = Vec::new();

        if let CertificateScope::Course(course_id) = cert.scope {
            if let Err(e) = self.store.mark_enrollment_completed(cert.user_id, course_id, cert.issued_at).await {
                tracing::error!(number = %cert.certificate_number, error = %e, "enrollment completion not recorded");
                problems.push(format!("enrollment: {e}"));
            }
        }

        let certificate = match self.ensure_artifacts(cert.clone()).await {
            Ok((certificate, artifact_error)) => {
                problems.extend(artifact_error);
                certificate
            }
            Err(e) => {
                tracing::error!(number = %cert.certificate_number, error = %e, "certificate artifacts not stored");
                problems.push(format!("artifacts: {e}"));
                cert
            }
        };

        let artifact_error = (!problems.is_empty()).then(|| problems.join("; "));
        IssueOutcome { certificate, created, artifact_error }
    }

    /// Issues the scope certificate if the learner is certifiable, using the
    /// best passing score.
    pub async fn issue_if_eligible(&self, user_id: Uuid, scope: Scope) -> LmsResult<Option<IssueOutcome>> {
        let result = eligibility::evaluate_scope(self.store.as_ref(), user_id, scope).await?;
        match (result.certifiable, result.best_passing_score) {
            (true, Some(score)) => Ok(Some(self.issue(user_id, scope.into(), score).await?)),
            _ => Ok(None),
        }
    }

    /// Whole-program certificate from the cross-course average.
    pub async fn issue_program(&self, user_id: Uuid, threshold: f64) -> LmsResult<IssueOutcome> {
        if let Some(existing) = self.store.find_certificate(user_id, CertificateScope::Program).await? {
            return Ok(self.settle(existing, false).await);
        }
        let standing = eligibility::evaluate_program(self.store.as_ref(), user_id, threshold).await?;
        match standing.average_score {
            Some(avg) if standing.eligible => self.issue(user_id, CertificateScope::Program, avg).await,
            _ => Err(LmsError::NotEligible(standing.reason())),
        }
    }

    async fn title_of(&self, scope: CertificateScope) -> LmsResult<String> {
        Ok(match scope {
            CertificateScope::Course(id) => self
                .store
                .get_course(id)
                .await?
                .map(|c| c.title)
                .unwrap_or_else(|| "Unknown course".into()),
            CertificateScope::Module(id) => self
                .store
                .get_unit(id)
                .await?
                .map(|u| u.title)
                .unwrap_or_else(|| "Unknown module".into()),
            CertificateScope::Program => self.program_title.clone(),
        })
    }

    async fn document_for(&self, cert: &Certificate) -> LmsResult<CertificateDocument> {
        let holder = self.store.get_user(cert.user_id).await?;
        Ok(CertificateDocument {
            certificate_number: cert.certificate_number.clone(),
            holder_name: holder.as_ref().map(|u| u.full_name.clone()).unwrap_or_default(),
            holder_email: holder.map(|u| u.email).unwrap_or_default(),
            title: self.title_of(cert.scope).await?,
            score: cert.score,
            issued_at: cert.issued_at,
            issuer_name: self.issuer_name.clone(),
            verification_url: cert.verification_url.clone(),
        })
    }

    /// Renders whichever artifacts are missing and stores them. Render
    /// failures are returned as a message, storage failures as errors.
    pub async fn ensure_artifacts(&self, mut cert: Certificate) -> LmsResult<(Certificate, Option<String>)> {
        if cert.has_artifacts() {
            return Ok((cert, None));
        }
        let doc = self.document_for(&cert).await?;
        let mut failures = Vec::new();

        if cert.qr_code.is_none() {
            match self.renderer.render_qr(&verification_payload(&doc)).await {
                Ok(png) => cert.qr_code = Some(png),
                Err(e) => failures.push(format!("qr: {e}")),
            }
        }
        if cert.document.is_none() {
            match self.renderer.render_document(&doc).await {
                Ok(pdf) => cert.document = Some(pdf),
                Err(e) => failures.push(format!("document: {e}")),
            }
        }

        if cert.qr_code.is_some() || cert.document.is_some() {
            self.store
                .save_certificate_artifacts(cert.id, cert.qr_code.as_deref(), cert.document.as_deref())
                .await?;
        }

        if failures.is_empty() {
            return Ok((cert, None));
        }
        let message = failures.join("; ");
        tracing::warn!(number = %cert.certificate_number, error = %message, "certificate artifacts not rendered");
        Ok((cert, Some(message)))
    }

    async fn owned(&self, user_id: Uuid, certificate_id: Uuid) -> LmsResult<Certificate> {
        self.store
            .get_certificate(certificate_id)
            .await?
            .filter(|c| c.user_id == user_id)
            .ok_or(LmsError::NotFound("certificate"))
    }

    pub async fn list(&self, user_id: Uuid) -> LmsResult<Vec<Certificate>> {
        Ok(self.store.list_certificates(user_id).await?)
    }

    pub async fn detail(&self, user_id: Uuid, certificate_id: Uuid) -> LmsResult<CertificateDetail> {
        let cert = self.owned(user_id, certificate_id).await?;
        let (certificate, artifact_error) = self.ensure_artifacts(cert).await?;
        Ok(CertificateDetail {
            title: self.title_of(certificate.scope).await?,
            has_document: certificate.document.is_some(),
            certificate,
            artifact_error,
        })
    }

    /// PDF bytes and a download file name.
    pub async fn download(&self, user_id: Uuid, certificate_id: Uuid) -> LmsResult<(String, Vec<u8>)> {
        let cert = self.owned(user_id, certificate_id).await?;
        let (cert, artifact_error) = self.ensure_artifacts(cert).await?;
        let filename = format!("Certificate_{}.pdf", cert.certificate_number);
        match cert.document {
            Some(pdf) => Ok((filename, pdf)),
            None => Err(LmsError::ArtifactUnavailable(
                artifact_error.unwrap_or_else(|| "not rendered".into()),
            )),
        }
    }

    /// Public lookup; unknown numbers are reported as invalid, not as errors.
    pub async fn verify(&self, number: &str) -> LmsResult<Verification> {
        let Some(cert) = self.store.find_certificate_by_number(number).await? else {
            return Ok(Verification {
                valid: false,
                certificate_number: number.to_string(),
                holder_name: None,
                title: None,
                score: None,
                issued_at: None,
                message: Some("Certificate not found".into()),
            });
        };
        let holder = self.store.get_user(cert.user_id).await?;
        Ok(Verification {
            valid: cert.is_valid,
            holder_name: holder.map(|u| u.full_name),
            title: Some(self.title_of(cert.scope).await?),
            score: Some(cert.score),
            issued_at: Some(cert.issued_at),
            certificate_number: cert.certificate_number,
            message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn number_format() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = certificate_number("COOP", CertificateScope::Program, &mut rng);
        assert!(n.starts_with("COOP-PRG-"), "{n}");
        let token = n.trim_start_matches("COOP-PRG-");
        assert_eq!(token.len(), 12);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));

        let other = certificate_number("COOP", CertificateScope::Course(Uuid::nil()), &mut rng);
        assert!(other.starts_with("COOP-CRS-"));
        assert_ne!(n.trim_start_matches("COOP-PRG-"), other.trim_start_matches("COOP-CRS-"));
    }

    #[test]
    fn verification_url_is_normalised() {
        assert_eq!(
            verification_url("https://lms.example/", "COOP-CRS-ABC"),
            "https://lms.example/certificates/verify/COOP-CRS-ABC"
        );
        assert_eq!(
            verification_url("http://h", "a b/c"),
            "http://h/certificates/verify/a%20b%2Fc"
        );
    }

    #[test]
    fn payload_carries_holder_and_score() {
        let doc = CertificateDocument {
            certificate_number: "COOP-CRS-000000000001".into(),
            holder_name: "Amina Mushi".into(),
            holder_email: "amina@example.com".into(),
            title: "AML Basics".into(),
            score: 87.5,
            issued_at: Utc::now(),
            issuer_name: "Risk Management & Compliance".into(),
            verification_url: "http://h/certificates/verify/COOP-CRS-000000000001".into(),
        };
        let p = verification_payload(&doc);
        assert!(p.contains("Certificate #: COOP-CRS-000000000001"));
        assert!(p.contains("Final Score: 87.5%"));
        assert!(p.contains("Verification: http://h/certificates/verify/"));
    }

    #[tokio::test]
    async fn stalled_render_service_times_out() {
        // accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let renderer = HttpRenderer::new(format!("http://{addr}/"), Duration::from_millis(300)).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), renderer.render_qr("payload"))
            .await
            .expect("render call should give up before the outer limit");
        assert!(matches!(result, Err(ArtifactError::Http(_))), "{result:?}");
    }
}
