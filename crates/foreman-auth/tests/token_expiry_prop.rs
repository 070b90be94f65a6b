use proptest::prelude::*;
use foreman_auth::hs256::{JwtHs256Token, JwtHs256Validator};
use foreman_auth::{Authority, CapabilityToken, Claims, TokenValidator};

proptest! {
    #[test]
    fn jwt_expiry_respected(delta_secs in -3600i64..3600i64) {
        let (validator, token) = tokio_test::block_on(async {
            let secret = "prop_secret";
            let now = chrono::Utc::now().timestamp() as u64;
            let exp = (now as i64 + delta_secs) as u64;
            let claims = Claims {
                sub: "tester".into(),
                authority: Authority::Worker,
                iat: now,
                exp,
                jti: "prop-test".into(),
            };
            let token = JwtHs256Token::mint(&claims, secret.as_bytes()).await.unwrap();
            let validator = JwtHs256Validator::new(secret);
            (validator, token)
        });
        let res = tokio_test::block_on(validator.validate(token.as_str()));
        if delta_secs >= 0 {
            prop_assert!(res.is_ok());
        } else {
            prop_assert!(res.is_err());
        }
    }
}
