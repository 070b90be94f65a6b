use foreman_auth::hs256::{build_claims, JwtHs256Token, JwtHs256Validator};
use foreman_auth::{Authority, CapabilityToken, TokenValidator};

#[tokio::test]
async fn test_jwt_hs256_mint_and_validate() {
    let secret = "super_secret_key";
    let claims = build_claims("guardian-1", Authority::Guardian, 3600).unwrap();

    let token = JwtHs256Token::mint(&claims, secret.as_bytes()).await.unwrap();
    let validator = JwtHs256Validator::new(secret);

    let validated = validator.validate(token.as_str()).await.unwrap();
    assert_eq!(validated.sub, claims.sub);
    assert_eq!(validated.authority, claims.authority);
}

#[tokio::test]
async fn test_jwt_hs256_invalid_token_is_rejected() {
    let validator = JwtHs256Validator::new("some_secret");
    assert!(validator.validate("not.a.valid.jwt").await.is_err());
}

#[tokio::test]
async fn test_is_valid_for_rejects_insufficient_authority() {
    let secret = "super_secret_key";
    let token = JwtHs256Token::new("watchdog-1", Authority::Watchdog, secret, 3600).unwrap();
    assert!(!token.is_valid_for(secret, Authority::Guardian));
    assert!(token.is_valid_for(secret, Authority::Watchdog));
}
