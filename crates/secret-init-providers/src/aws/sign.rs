//! AWS Signature Version 4 request signing.
//!
//! Covers exactly what the loader needs: POST requests with a JSON body
//! against a regional service endpoint, signed with static or shared-config
//! credentials.

use crate::aws::config::Credentials;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

const AMZ_DATE_FORMAT: &[FormatItem<'_>] =
    format_description!("[year][month][day]T[hour][minute][second]Z");
const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year][month][day]");

/// A signed request: the headers to attach, including `authorization`.
pub struct SignedHeaders {
    pub amz_date: String,
    pub authorization: String,
}

/// Sign a `POST /` JSON-RPC request.
///
/// `headers` must hold every header participating in the signature as
/// `(lowercase-name, value)`; `host` and `x-amz-date` are added here.
pub fn sign_post(
    host: &str,
    region: &str,
    service: &str,
    extra_headers: &[(&str, &str)],
    payload: &[u8],
    credentials: &Credentials,
    now: OffsetDateTime,
) -> SignedHeaders {
    let amz_date = now.format(AMZ_DATE_FORMAT).expect("formattable timestamp");
    let date = now.format(DATE_FORMAT).expect("formattable timestamp");

    let mut headers: Vec<(String, String)> = extra_headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.trim().to_string()))
        .collect();
    headers.push(("host".to_string(), host.to_string()));
    headers.push(("x-amz-date".to_string(), amz_date.clone()));
    if let Some(token) = &credentials.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.sort();

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{k}:{v}\n"))
        .collect();
    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "POST\n/\n\n{canonical_headers}\n{signed_headers}\n{}",
        hex(&Sha256::digest(payload))
    );

    let scope = format!("{date}/{region}/{service}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex(&Sha256::digest(canonical_request.as_bytes()))
    );

    let signing_key = derive_key(&credentials.secret_access_key, &date, region, service);
    let signature = hex(&hmac(&signing_key, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id
    );

    SignedHeaders {
        amz_date,
        authorization,
    }
}

fn derive_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn test_credentials() -> Credentials {
        Credentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
        }
    }

    #[test]
    fn test_sign_post_shape() {
        let signed = sign_post(
            "secretsmanager.us-west-2.amazonaws.com",
            "us-west-2",
            "secretsmanager",
            &[
                ("content-type", "application/x-amz-json-1.1"),
                ("x-amz-target", "secretsmanager.GetSecretValue"),
            ],
            br#"{"SecretId":"my-secret"}"#,
            &test_credentials(),
            datetime!(2015-08-30 12:36:00 UTC),
        );

        assert_eq!(signed.amz_date, "20150830T123600Z");
        assert!(signed.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-west-2/secretsmanager/aws4_request"
        ));
        assert!(signed
            .authorization
            .contains("SignedHeaders=content-type;host;x-amz-date;x-amz-target"));
        assert!(signed.authorization.contains("Signature="));
    }

    #[test]
    fn test_session_token_joins_signed_headers() {
        let mut credentials = test_credentials();
        credentials.session_token = Some("token".to_string());

        let signed = sign_post(
            "ssm.us-west-2.amazonaws.com",
            "us-west-2",
            "ssm",
            &[("content-type", "application/x-amz-json-1.1")],
            b"{}",
            &credentials,
            datetime!(2015-08-30 12:36:00 UTC),
        );

        assert!(signed
            .authorization
            .contains("content-type;host;x-amz-date;x-amz-security-token"));
    }

    #[test]
    fn test_signature_is_stable() {
        let a = sign_post(
            "secretsmanager.us-west-2.amazonaws.com",
            "us-west-2",
            "secretsmanager",
            &[("content-type", "application/x-amz-json-1.1")],
            b"{}",
            &test_credentials(),
            datetime!(2015-08-30 12:36:00 UTC),
        );
        let b = sign_post(
            "secretsmanager.us-west-2.amazonaws.com",
            "us-west-2",
            "secretsmanager",
            &[("content-type", "application/x-amz-json-1.1")],
            b"{}",
            &test_credentials(),
            datetime!(2015-08-30 12:36:00 UTC),
        );
        assert_eq!(a.authorization, b.authorization);
    }
}
