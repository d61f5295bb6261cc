//! Concrete session against the IRCTC e-ticketing service.
//!
//! One value of [`IrctcSession`] owns one authenticated browser-like
//! session: a cookie jar, the rotating anti-forgery token and the
//! bearer token from login. The service rotates the anti-forgery value
//! on every response via the `csrf-token` header; each request echoes
//! the latest one back in `spa-csrf-token`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::run::{BookingJob, Credential, PaymentMethod, Proxy};
use crate::solver::ChallengeSolver;

use super::types::{
    Challenge, ChallengeOutcome, FormOutcome, PaymentHandle, RemoteSession, SessionError,
    SessionFactory, Settlement,
};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";

/// Fallback settlement poll cadence when the gateway omits its own.
const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 600_000;

#[derive(Default)]
struct AuthState {
    /// Anti-forgery value, seeded with the epoch and rotated from
    /// every `csrf-token` response header.
    csrf: String,
    /// Login captcha correlation id, echoed back as `greq`.
    login_uid: String,
    access_token: String,
    user_hash: String,
    /// Settlement poll parameters captured at payment initiation.
    poll: Option<PollState>,
}

#[derive(Clone)]
struct PollState {
    url: String,
    interval_ms: u64,
    timeout_ms: u64,
}

pub struct IrctcSession {
    client: reqwest::Client,
    base_url: String,
    credential: Credential,
    solver: Arc<dyn ChallengeSolver>,
    auth: Mutex<AuthState>,
}

impl IrctcSession {
    fn new(
        client: reqwest::Client,
        base_url: String,
        credential: Credential,
        solver: Arc<dyn ChallengeSolver>,
    ) -> Self {
        let auth = AuthState {
            csrf: Utc::now().timestamp_millis().to_string(),
            ..AuthState::default()
        };
        Self {
            client,
            base_url,
            credential,
            solver,
            auth: Mutex::new(auth),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Attach the session headers the service checks on every
    /// authenticated endpoint.
    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let auth = self.auth.lock().unwrap();
        request
            .header("greq", &auth.login_uid)
            .header("spa-csrf-token", &auth.csrf)
            .header("Authorization", &auth.access_token)
            .header("bmiyek", &auth.user_hash)
    }

    /// Send a request, classify HTTP-level failures, rotate the
    /// anti-forgery token and surface remote business rejections.
    async fn call(&self, request: reqwest::RequestBuilder) -> Result<Value, SessionError> {
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::BAD_GATEWAY {
            return Err(SessionError::Transient("502 from upstream".to_string()));
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(SessionError::AuthExpired);
        }
        if let Some(token) = response
            .headers()
            .get("csrf-token")
            .and_then(|v| v.to_str().ok())
        {
            self.auth.lock().unwrap().csrf = token.to_string();
        }
        let body: Value = response.json().await?;
        if let Some(message) = body.get("errorMessage").and_then(Value::as_str) {
            return Err(SessionError::Business(message.to_string()));
        }
        Ok(body)
    }

    async fn fetch_login_challenge(&self) -> Result<(String, Challenge), SessionError> {
        let csrf = self.auth.lock().unwrap().csrf.clone();
        let body = self
            .call(
                self.client
                    .get(self.url(
                        "/eticketing/protected/mapps1/loginCaptcha?nlpCaptchaException=true",
                    ))
                    .header("greq", csrf),
            )
            .await?;
        let uid = body
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Transport("login captcha without uid".to_string()))?
            .to_string();
        let challenge = decode_challenge(&body, "captchaQuestion")?;
        Ok((uid, challenge))
    }
}

fn decode_challenge(body: &Value, field: &str) -> Result<Challenge, SessionError> {
    let encoded = body
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| SessionError::Transport(format!("response without {field}")))?;
    let image = BASE64
        .decode(encoded)
        .map_err(|e| SessionError::Transport(format!("undecodable challenge image: {e}")))?;
    Ok(Challenge { image })
}

/// Journey date in the `yyyymmdd` form every booking endpoint expects.
fn wire_date(job: &BookingJob) -> String {
    job.date.format("%Y%m%d").to_string()
}

fn search_body(job: &BookingJob) -> Value {
    json!({
        "concessionBooking": false,
        "srcStn": job.origin,
        "destStn": job.destination,
        "jrnyClass": job.travel_class.as_code(),
        "jrnyDate": wire_date(job),
        "quotaCode": job.quota.as_code(),
        "currentBooking": "false",
        "flexiFlag": false,
        "handicapFlag": false,
        "ticketType": "E",
        "loyaltyRedemptionBooking": false,
        "ftBooking": false,
    })
}

fn availability_path(job: &BookingJob) -> String {
    format!(
        "/eticketing/protected/mapps1/avlFarenquiry/{}/{}/{}/{}/{}/{}/N",
        job.train,
        wire_date(job),
        job.origin,
        job.destination,
        job.travel_class.as_code(),
        job.quota.as_code(),
    )
}

fn boarding_body(job: &BookingJob) -> Value {
    json!({
        "clusterFlag": "N",
        "onwardFlag": "N",
        "cod": "false",
        "reservationMode": "WS_TA_B2C",
        "autoUpgradationSelected": false,
        "gnToCkOpted": false,
        "paymentType": 1,
        "twoPhaseAuthRequired": false,
        "captureAddress": 0,
        "alternateAvlInputDTO": [{
            "trainNo": job.train,
            "destStn": job.destination,
            "srcStn": job.origin,
            "jrnyDate": wire_date(job),
            "quotaCode": job.quota.as_code(),
            "jrnyClass": job.travel_class.as_code(),
            "concessionPassengers": false,
        }],
        "passBooking": false,
        "journalistBooking": false,
    })
}

fn form_body(job: &BookingJob, user_id: &str) -> Value {
    let passengers: Vec<Value> = job
        .passengers
        .iter()
        .map(|p| {
            json!({
                "passengerName": p.name,
                "passengerAge": p.age,
                "passengerGender": p.sex,
                "passengerBerthChoice": p.berth.as_code(),
                "passengerNationality": "IN",
                "passengerCardTypeMaster": Value::Null,
                "childBerthFlag": true,
            })
        })
        .collect();
    json!({
        "clusterFlag": "N",
        "onwardFlag": "N",
        "cod": "false",
        "reservationMode": "WS_TA_B2C",
        "autoUpgradationSelected": false,
        "gnToCkOpted": false,
        "twoPhaseAuthRequired": false,
        "captureAddress": 0,
        "ticketType": "E",
        "mobileNumber": job.contact,
        "moreThanOneDay": false,
        "lapAvlRequestDTO": [{
            "trainNo": job.train,
            "journeyDate": wire_date(job),
            "fromStnCode": job.origin,
            "toStnCode": job.destination,
            "journeyClass": job.travel_class.as_code(),
            "quota": job.quota.as_code(),
            "currentBooking": "false",
            "wsUserLogin": user_id,
            "boardingStation": job.origin,
            "passengerList": passengers,
        }],
    })
}

/// Gateway descriptor for the chosen settlement channel.
fn payment_body(method: PaymentMethod, amount: f64) -> Value {
    match method {
        PaymentMethod::UpiCollect => json!({
            "bankId": "117",
            "txnType": 1,
            "paramList": [],
            "amount": amount,
            "transationId": 0,
            "txnStatus": 1,
        }),
        PaymentMethod::Wallet => json!({
            "bankId": 1000,
            "txnType": 7,
            "paramList": [{"key": "TXN_PASSWORD", "value": ""}],
            "amount": amount,
            "transationId": 0,
            "txnStatus": 1,
        }),
    }
}

fn order_id_from(body: &Value) -> Option<String> {
    body.get("paramList")?
        .as_array()?
        .iter()
        .find(|p| p.get("key").and_then(Value::as_str) == Some("TXN"))?
        .get("value")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait::async_trait]
impl RemoteSession for IrctcSession {
    fn name(&self) -> &str {
        "irctc"
    }

    async fn login(&self) -> Result<(), SessionError> {
        // The service sometimes rejects a correct-looking captcha
        // answer; it hands out a fresh image and the sequence repeats.
        loop {
            let (uid, challenge) = self.fetch_login_challenge().await?;
            let answer = self
                .solver
                .solve(&challenge.image)
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?;

            let body = self
                .call(self.client.post(self.url("/authprovider/webtoken")).form(&[
                    ("grant_type", "password"),
                    ("username", self.credential.user_id.as_str()),
                    ("password", &BASE64.encode(&self.credential.password)),
                    ("captcha", answer.as_str()),
                    ("uid", uid.as_str()),
                    ("otpLogin", "false"),
                    ("nlpIdentifier", ""),
                    ("nlpAnswer", ""),
                    ("nlpToken", ""),
                    ("lso", ""),
                    ("encodedPwd", "true"),
                ]))
                .await?;

            if let Some(error) = body.get("error").and_then(Value::as_str) {
                let description = body
                    .get("error_description")
                    .and_then(Value::as_str)
                    .unwrap_or(error);
                if error == "unauthorized" && description.starts_with("Invalid Captcha") {
                    warn!("login captcha rejected, requesting a fresh one");
                    continue;
                }
                if error == "unauthorized" && description == "Bad credentials" {
                    return Err(SessionError::AuthInvalid(format!(
                        "bad credentials for {}",
                        self.credential.user_id
                    )));
                }
                return Err(SessionError::Business(description.to_string()));
            }

            let token = body
                .get("access_token")
                .and_then(Value::as_str)
                .ok_or_else(|| SessionError::Transport("login without access token".to_string()))?;
            {
                let mut auth = self.auth.lock().unwrap();
                auth.login_uid = uid;
                auth.access_token = format!("Bearer {token}");
            }

            let user = self
                .call(self.authed(self.client.get(
                    self.url("/eticketing/protected/mapps1/validateUser?source=3"),
                )))
                .await?;
            let verified = user.get("emailVerified").and_then(Value::as_bool) == Some(true)
                && user.get("mobileVerified").and_then(Value::as_bool) == Some(true);
            if !verified {
                return Err(SessionError::AuthInvalid(
                    "account email or mobile not verified".to_string(),
                ));
            }
            if let Some(hash) = user.get("userIdHash").and_then(Value::as_str) {
                self.auth.lock().unwrap().user_hash = hash.to_string();
            }
            debug!(user = %self.credential.user_id, "login complete");
            return Ok(());
        }
    }

    async fn server_time(&self) -> Result<i64, SessionError> {
        let epoch = Utc::now().timestamp_millis();
        let path = format!("/eticketing/protected/profile/textToNumber/{epoch}");
        let csrf = self.auth.lock().unwrap().csrf.clone();
        let response = self
            .client
            .get(self.url(&path))
            .header("greq", csrf)
            .send()
            .await?;
        let text = response.text().await?;
        text.trim()
            .parse::<i64>()
            .map_err(|_| SessionError::Transport(format!("unparseable time response: {text}")))
    }

    async fn search_trains(&self, job: &BookingJob) -> Result<(), SessionError> {
        self.call(
            self.authed(
                self.client
                    .post(self.url("/eticketing/protected/mapps1/altAvlEnq/TC")),
            )
            .json(&search_body(job)),
        )
        .await?;
        Ok(())
    }

    async fn check_availability(&self, job: &BookingJob) -> Result<(), SessionError> {
        self.call(
            self.authed(self.client.post(self.url(&availability_path(job))))
                .json(&json!({
                    "classCode": job.travel_class.as_code(),
                    "concessionBooking": false,
                    "fromStnCode": job.origin,
                    "ftBooking": false,
                    "isLogedinReq": true,
                    "journeyDate": wire_date(job),
                    "loyaltyRedemptionBooking": false,
                    "moreThanOneDay": true,
                    "paymentFlag": "N",
                    "quotaCode": job.quota.as_code(),
                    "ticketType": "E",
                    "toStnCode": job.destination,
                    "trainNumber": job.train,
                })),
        )
        .await?;
        Ok(())
    }

    async fn boarding_stations(&self, job: &BookingJob) -> Result<(), SessionError> {
        self.call(
            self.authed(
                self.client
                    .post(self.url("/eticketing/protected/mapps1/boardingStationEnq")),
            )
            .json(&boarding_body(job)),
        )
        .await?;
        Ok(())
    }

    async fn submit_form(
        &self,
        job: &BookingJob,
        _transaction_id: &str,
    ) -> Result<FormOutcome, SessionError> {
        let body = self
            .call(
                self.authed(
                    self.client
                        .post(self.url("/eticketing/protected/mapps1/allLapAvlFareEnq/Y")),
                )
                .json(&form_body(job, &self.credential.user_id)),
            )
            .await?;

        if body.get("confirmation").is_some() {
            return Err(SessionError::Business(
                "tickets are unavailable".to_string(),
            ));
        }
        let captcha = body
            .get("captchaDto")
            .ok_or_else(|| SessionError::Transport("form response without captcha".to_string()))?;
        if captcha.get("nlpcaptchEnabled").and_then(Value::as_bool) == Some(true) {
            return Err(SessionError::ChallengeUnsupported(
                "service demanded an NLP captcha".to_string(),
            ));
        }
        let challenge = decode_challenge(captcha, "captchaQuestion")?;
        let amount = body
            .get("totalCollectibleAmount")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                SessionError::Transport("form response without collectible amount".to_string())
            })?;
        Ok(FormOutcome { challenge, amount })
    }

    async fn verify_challenge(
        &self,
        transaction_id: &str,
        answer: &str,
    ) -> Result<ChallengeOutcome, SessionError> {
        let path = format!(
            "/eticketing/protected/mapps1/captchaverify/{transaction_id}/BOOKINGWS/{answer}"
        );
        let body = self.call(self.authed(self.client.get(self.url(&path)))).await?;
        match body.get("status").and_then(Value::as_str) {
            Some("SUCCESS") => Ok(ChallengeOutcome::Accepted),
            Some("FAIL") => Ok(ChallengeOutcome::Rejected(decode_challenge(
                &body,
                "captchaQuestion",
            )?)),
            other => Err(SessionError::Transport(format!(
                "unexpected challenge verdict: {other:?}"
            ))),
        }
    }

    async fn select_payment(
        &self,
        job: &BookingJob,
        transaction_id: &str,
        amount: f64,
    ) -> Result<PaymentHandle, SessionError> {
        let path = format!(
            "/eticketing/protected/mapps1/bookingInitPayment/{transaction_id}?insurenceApplicable="
        );
        let body = self
            .call(
                self.authed(self.client.post(self.url(&path)))
                    .json(&payment_body(job.payment, amount)),
            )
            .await?;
        if let Some(message) = body.get("errorMsg").and_then(Value::as_str) {
            return Err(SessionError::Business(message.to_string()));
        }

        let poll = PollState {
            url: body
                .get("upiStatusUrl")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    self.url(&format!(
                        "/eticketing/protected/mapps1/bookingData/{transaction_id}"
                    ))
                }),
            interval_ms: body
                .get("STATUS_INTERVAL")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            timeout_ms: body
                .get("STATUS_TIMEOUT")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_POLL_TIMEOUT_MS),
        };
        self.auth.lock().unwrap().poll = Some(poll);

        Ok(PaymentHandle {
            transaction_id: transaction_id.to_string(),
            order_id: order_id_from(&body),
        })
    }

    async fn poll_settlement(&self, handle: &PaymentHandle) -> Result<Settlement, SessionError> {
        let poll = self
            .auth
            .lock()
            .unwrap()
            .poll
            .clone()
            .ok_or_else(|| {
                SessionError::Transport("settlement polled before payment initiation".to_string())
            })?;
        let body = self
            .call(self.authed(self.client.get(&poll.url)).query(&[(
                "transactionId",
                handle.transaction_id.as_str(),
            )]))
            .await?;

        if body.get("POLL_STATUS").and_then(Value::as_str) == Some("POLL_AGAIN") {
            return Ok(Settlement::Pending {
                retry_after_ms: poll.interval_ms,
                timeout_ms: poll.timeout_ms,
            });
        }
        if let Some(pnr) = body.get("pnrNumber").and_then(Value::as_str) {
            return Ok(Settlement::Settled {
                reference: Some(pnr.to_string()),
            });
        }
        if let Some(reason) = body.get("resultMsg").and_then(Value::as_str) {
            return Ok(Settlement::Failed {
                reason: reason.to_string(),
            });
        }
        Ok(Settlement::Settled {
            reference: handle.order_id.clone(),
        })
    }
}

/// Builds one HTTP session per attempt, each with its own cookie jar
/// and optional egress proxy.
pub struct IrctcSessionFactory {
    base_url: String,
    timeout: Duration,
    solver: Arc<dyn ChallengeSolver>,
}

impl IrctcSessionFactory {
    pub fn new(base_url: String, timeout: Duration, solver: Arc<dyn ChallengeSolver>) -> Self {
        Self {
            base_url,
            timeout,
            solver,
        }
    }
}

impl SessionFactory for IrctcSessionFactory {
    fn create(
        &self,
        credential: &Credential,
        proxy: Option<&Proxy>,
    ) -> Result<Arc<dyn RemoteSession>, SessionError> {
        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .timeout(self.timeout);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(&proxy.0)
                .map_err(|e| SessionError::Transport(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build()?;
        Ok(Arc::new(IrctcSession::new(
            client,
            self.base_url.clone(),
            credential.clone(),
            self.solver.clone(),
        )))
    }
}
