//! Outbound redirect to the payment gateway.
//!
//! Building a URL mints a transaction reference, persists a `pending`
//! payment record for it, and only then returns the signed redirect. A crash
//! between the two still leaves the attempt traceable.

use crate::config::GatewayConfig;
use crate::database::payment_record_repository::PaymentRecordStore;
use crate::logging::mask_reference;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::order::OrderCollaborator;
use crate::payments::signer::{SignableParams, Signer, SIGNATURE_TYPE};
use crate::payments::types::{
    fits_minor_units, NewPaymentRecord, OrderStatus, PaymentMethod, PaymentRecord, PaymentStatus,
};
use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, instrument};
use url::Url;
use uuid::Uuid;

/// Fixed-width timestamp format of the gateway protocol
pub const GATEWAY_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Input to [`GatewayUrlBuilder::create_payment_url`]
#[derive(Debug, Clone)]
pub struct PaymentUrlRequest {
    pub order_id: String,
    /// Charge this instead of the order total
    pub amount: Option<BigDecimal>,
    pub client_ip: String,
    pub bank_code: Option<String>,
    pub locale: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayRedirect {
    pub payment_url: String,
    pub transaction_reference: String,
    pub record: PaymentRecord,
}

/// Signed fields of the outbound redirect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundParams {
    pub version: String,
    pub command: String,
    pub tmn_code: String,
    pub amount: String,
    pub currency: String,
    pub txn_ref: String,
    pub order_info: String,
    pub order_type: String,
    pub locale: String,
    pub return_url: String,
    pub ip_addr: String,
    pub create_date: String,
    pub expire_date: String,
    pub bank_code: Option<String>,
}

impl SignableParams for OutboundParams {
    fn signing_pairs(&self) -> Vec<(String, Option<String>)> {
        let field = |name: &str, value: &str| (name.to_string(), Some(value.to_string()));
        vec![
            field("vnp_Version", &self.version),
            field("vnp_Command", &self.command),
            field("vnp_TmnCode", &self.tmn_code),
            field("vnp_Amount", &self.amount),
            field("vnp_CurrCode", &self.currency),
            field("vnp_TxnRef", &self.txn_ref),
            field("vnp_OrderInfo", &self.order_info),
            field("vnp_OrderType", &self.order_type),
            field("vnp_Locale", &self.locale),
            field("vnp_ReturnUrl", &self.return_url),
            field("vnp_IpAddr", &self.ip_addr),
            field("vnp_CreateDate", &self.create_date),
            field("vnp_ExpireDate", &self.expire_date),
            ("vnp_BankCode".to_string(), self.bank_code.clone()),
        ]
    }
}

pub struct GatewayUrlBuilder {
    config: Arc<GatewayConfig>,
    signer: Signer,
    orders: Arc<dyn OrderCollaborator>,
    records: Arc<dyn PaymentRecordStore>,
}

impl GatewayUrlBuilder {
    pub fn new(
        config: Arc<GatewayConfig>,
        orders: Arc<dyn OrderCollaborator>,
        records: Arc<dyn PaymentRecordStore>,
    ) -> PaymentResult<Self> {
        let signer = Signer::new(&config.hash_secret)?;
        let pay_url = Url::parse(&config.pay_url).map_err(|e| PaymentError::ConfigurationError {
            message: format!("invalid gateway pay URL: {}", e),
        })?;
        // The signed parameters replace the whole query string
        if pay_url.query().is_some() {
            return Err(PaymentError::ConfigurationError {
                message: "gateway pay URL must not carry a query string".to_string(),
            });
        }
        Ok(Self {
            config,
            signer,
            orders,
            records,
        })
    }

    pub async fn create_payment_url(
        &self,
        request: PaymentUrlRequest,
    ) -> PaymentResult<GatewayRedirect> {
        self.create_payment_url_at(request, Utc::now()).await
    }

    /// Same as [`create_payment_url`](Self::create_payment_url) with an explicit clock
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn create_payment_url_at(
        &self,
        request: PaymentUrlRequest,
        now: DateTime<Utc>,
    ) -> PaymentResult<GatewayRedirect> {
        let order = self
            .orders
            .resolve(&request.order_id)
            .await?
            .ok_or_else(|| PaymentError::OrderNotFound {
                order_id: request.order_id.clone(),
            })?;

        if order.payment_method != PaymentMethod::Gateway {
            return Err(PaymentError::PaymentMethodMismatch {
                order_id: order.order_id,
                declared: order.payment_method,
                requested: PaymentMethod::Gateway,
            });
        }

        if order.status != OrderStatus::Pending {
            return Err(PaymentError::OrderNotPayable {
                order_id: order.order_id,
                status: order.status,
            });
        }

        let amount = request.amount.unwrap_or(order.total);
        if amount <= BigDecimal::zero() || !fits_minor_units(&amount) {
            return Err(PaymentError::InvalidAmount {
                amount: amount.to_string(),
            });
        }

        let local_now = now.with_timezone(&self.config.clock_offset);
        let reference = mint_reference(&local_now);
        let expires = local_now + Duration::minutes(self.config.expire_minutes);

        let record = self
            .records
            .insert(NewPaymentRecord {
                order_id: order.order_id.clone(),
                method: PaymentMethod::Gateway,
                status: PaymentStatus::Pending,
                amount,
                currency: self.config.currency.clone(),
                transaction_reference: Some(reference.clone()),
            })
            .await?;

        // Sign exactly what was persisted; the callback is checked against it
        let params = OutboundParams {
            version: self.config.version.clone(),
            command: self.config.command.clone(),
            tmn_code: self.config.tmn_code.clone(),
            amount: record.amount_minor_units(),
            currency: self.config.currency.clone(),
            txn_ref: reference.clone(),
            order_info: format!("Payment for order {}", order.order_id),
            order_type: self.config.order_type.clone(),
            locale: request
                .locale
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(|| self.config.locale.clone()),
            return_url: self.config.return_url.clone(),
            ip_addr: normalize_ip(&request.client_ip),
            create_date: local_now.format(GATEWAY_TIME_FORMAT).to_string(),
            expire_date: expires.format(GATEWAY_TIME_FORMAT).to_string(),
            bank_code: request.bank_code.filter(|b| !b.trim().is_empty()),
        };

        let payment_url = self.assemble_url(&params)?;

        info!(
            transaction_reference = %mask_reference(&reference),
            payment_id = %record.id,
            amount = %record.amount,
            "Gateway payment URL created"
        );

        Ok(GatewayRedirect {
            payment_url,
            transaction_reference: reference,
            record,
        })
    }

    /// The signature and its type are appended after signing and never signed themselves
    fn assemble_url(&self, params: &OutboundParams) -> PaymentResult<String> {
        let signed = self.signer.sign_params(params);
        let mut url =
            Url::parse(&self.config.pay_url).map_err(|e| PaymentError::ConfigurationError {
                message: format!("invalid gateway pay URL: {}", e),
            })?;
        url.set_query(Some(&format!(
            "{}&vnp_SecureHashType={}&vnp_SecureHash={}",
            signed.canonical, SIGNATURE_TYPE, signed.signature
        )));
        Ok(url.into())
    }
}

/// Timestamp in the gateway's clock followed by eight random hex characters
fn mint_reference(local_now: &DateTime<FixedOffset>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{}{}",
        local_now.format(GATEWAY_TIME_FORMAT),
        random[..8].to_uppercase()
    )
}

/// Collapse loopback forms to `127.0.0.1` and unwrap IPv4-mapped IPv6.
/// Unparseable input is passed through trimmed.
pub fn normalize_ip(raw: &str) -> String {
    let candidate = raw.split(',').next().unwrap_or("").trim();
    match candidate.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) if v4.is_loopback() => "127.0.0.1".to_string(),
        Ok(IpAddr::V4(v4)) => v4.to_string(),
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) if v4.is_loopback() => "127.0.0.1".to_string(),
            Some(v4) => v4.to_string(),
            None if v6.is_loopback() => "127.0.0.1".to_string(),
            None => v6.to_string(),
        },
        Err(_) if candidate.is_empty() => "127.0.0.1".to_string(),
        Err(_) => candidate.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::in_memory::InMemoryPaymentRecordStore;
    use crate::payments::order::InMemoryOrderDirectory;
    use crate::payments::types::{OrderStatus, OrderSummary};
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::str::FromStr;

    fn config() -> GatewayConfig {
        GatewayConfig {
            tmn_code: "DEMOSHOP".to_string(),
            hash_secret: "secret".to_string(),
            pay_url: "https://sandbox.gateway.test/paymentv2/vpcpay.html".to_string(),
            return_url: "https://shop.test/api/payments/gateway/return".to_string(),
            version: "2.1.0".to_string(),
            command: "pay".to_string(),
            locale: "vn".to_string(),
            currency: "VND".to_string(),
            order_type: "other".to_string(),
            clock_offset: FixedOffset::east_opt(7 * 3600).unwrap(),
            expire_minutes: 15,
            success_redirect_url: "https://shop.test/success".to_string(),
            failure_redirect_url: "https://shop.test/failure".to_string(),
        }
    }

    async fn fixture(
        method: PaymentMethod,
        total: i64,
    ) -> (GatewayUrlBuilder, Arc<InMemoryPaymentRecordStore>) {
        fixture_with_status(method, total, OrderStatus::Pending).await
    }

    async fn fixture_with_status(
        method: PaymentMethod,
        total: i64,
        status: OrderStatus,
    ) -> (GatewayUrlBuilder, Arc<InMemoryPaymentRecordStore>) {
        let orders = Arc::new(InMemoryOrderDirectory::new());
        orders
            .upsert(OrderSummary {
                order_id: "O1".to_string(),
                total: BigDecimal::from(total),
                payment_method: method,
                status,
            })
            .await;
        let records = Arc::new(InMemoryPaymentRecordStore::new());
        let builder =
            GatewayUrlBuilder::new(Arc::new(config()), orders, records.clone()).unwrap();
        (builder, records)
    }

    fn request(order_id: &str) -> PaymentUrlRequest {
        PaymentUrlRequest {
            order_id: order_id.to_string(),
            amount: None,
            client_ip: "::1".to_string(),
            bank_code: None,
            locale: None,
        }
    }

    fn query_of(url: &str) -> HashMap<String, String> {
        Url::parse(url).unwrap().query_pairs().into_owned().collect()
    }

    #[tokio::test]
    async fn builds_signed_url_and_persists_pending_record() {
        let (builder, records) = fixture(PaymentMethod::Gateway, 150000).await;
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 3, 4, 5).unwrap();

        let redirect = builder.create_payment_url_at(request("O1"), now).await.unwrap();
        let query = query_of(&redirect.payment_url);

        assert_eq!(query["vnp_Amount"], "15000000");
        assert_eq!(query["vnp_TmnCode"], "DEMOSHOP");
        assert_eq!(query["vnp_IpAddr"], "127.0.0.1");
        assert_eq!(query["vnp_CreateDate"], "20261016100405");
        assert_eq!(query["vnp_ExpireDate"], "20261016101905");
        assert_eq!(query["vnp_SecureHashType"], "SHA512");
        assert_eq!(query["vnp_TxnRef"], redirect.transaction_reference);
        assert!(!query.contains_key("vnp_BankCode"));
        assert!(redirect.transaction_reference.starts_with("20261016100405"));
        assert_eq!(redirect.transaction_reference.len(), 22);

        let stored = records
            .find_by_reference(&redirect.transaction_reference)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert_eq!(stored.amount, BigDecimal::from(150000));
    }

    #[tokio::test]
    async fn signature_fields_are_appended_last() {
        let (builder, _) = fixture(PaymentMethod::Gateway, 150000).await;
        let redirect = builder.create_payment_url(request("O1")).await.unwrap();

        let query = Url::parse(&redirect.payment_url)
            .unwrap()
            .query()
            .unwrap()
            .to_string();
        let (signed, tail) = query.split_once("&vnp_SecureHashType=").unwrap();
        assert!(tail.starts_with("SHA512&vnp_SecureHash="));

        let signature = tail.trim_start_matches("SHA512&vnp_SecureHash=");
        let signer = Signer::new("secret").unwrap();
        assert!(signer.verify(signed, signature));
    }

    #[tokio::test]
    async fn override_amount_and_bank_code_are_carried() {
        let (builder, _) = fixture(PaymentMethod::Gateway, 150000).await;
        let mut req = request("O1");
        req.amount = Some(BigDecimal::from(99000));
        req.bank_code = Some("NCB".to_string());
        req.locale = Some("en".to_string());

        let redirect = builder.create_payment_url(req).await.unwrap();
        let query = query_of(&redirect.payment_url);
        assert_eq!(query["vnp_Amount"], "9900000");
        assert_eq!(query["vnp_BankCode"], "NCB");
        assert_eq!(query["vnp_Locale"], "en");
    }

    #[tokio::test]
    async fn unknown_order_is_rejected() {
        let (builder, records) = fixture(PaymentMethod::Gateway, 150000).await;
        let err = builder.create_payment_url(request("missing")).await.unwrap_err();
        assert!(matches!(err, PaymentError::OrderNotFound { .. }));
        assert!(records.is_empty().await);
    }

    #[tokio::test]
    async fn non_positive_amount_is_rejected() {
        let (builder, records) = fixture(PaymentMethod::Gateway, 0).await;
        let err = builder.create_payment_url(request("O1")).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvalidAmount { .. }));

        let mut req = request("O1");
        req.amount = Some(BigDecimal::from(-5));
        let err = builder.create_payment_url(req).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvalidAmount { .. }));
        assert!(records.is_empty().await);
    }

    #[tokio::test]
    async fn sub_cent_amounts_are_rejected_before_anything_is_stored() {
        let (builder, records) = fixture(PaymentMethod::Gateway, 150000).await;

        for raw in ["12.345", "0.001"] {
            let mut req = request("O1");
            req.amount = Some(BigDecimal::from_str(raw).unwrap());
            let err = builder.create_payment_url(req).await.unwrap_err();
            assert!(matches!(err, PaymentError::InvalidAmount { .. }), "{}", raw);
        }
        assert!(records.is_empty().await);
    }

    #[tokio::test]
    async fn signed_amount_matches_stored_amount() {
        let (builder, records) = fixture(PaymentMethod::Gateway, 150000).await;
        let mut req = request("O1");
        req.amount = Some(BigDecimal::from_str("12.35").unwrap());

        let redirect = builder.create_payment_url(req).await.unwrap();
        let stored = records
            .find_by_reference(&redirect.transaction_reference)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(query_of(&redirect.payment_url)["vnp_Amount"], "1235");
        assert_eq!(stored.amount_minor_units(), "1235");
    }

    #[tokio::test]
    async fn settled_or_cancelled_orders_get_no_new_attempt() {
        for status in [OrderStatus::Paid, OrderStatus::Canceled, OrderStatus::Shipped] {
            let (builder, records) =
                fixture_with_status(PaymentMethod::Gateway, 150000, status).await;
            let err = builder.create_payment_url(request("O1")).await.unwrap_err();
            assert!(
                matches!(err, PaymentError::OrderNotPayable { status: s, .. } if s == status),
                "{:?}",
                status
            );
            assert!(records.is_empty().await);
        }
    }

    #[test]
    fn pay_url_with_query_is_a_configuration_error() {
        let mut cfg = config();
        cfg.pay_url = "https://sandbox.gateway.test/pay?channel=web".to_string();
        let result = GatewayUrlBuilder::new(
            Arc::new(cfg),
            Arc::new(InMemoryOrderDirectory::new()),
            Arc::new(InMemoryPaymentRecordStore::new()),
        );
        assert!(matches!(result, Err(PaymentError::ConfigurationError { .. })));
    }

    #[tokio::test]
    async fn cod_order_cannot_go_through_gateway() {
        let (builder, _) = fixture(PaymentMethod::Cod, 150000).await;
        let err = builder.create_payment_url(request("O1")).await.unwrap_err();
        assert!(matches!(err, PaymentError::PaymentMethodMismatch { .. }));
    }

    #[test]
    fn blank_secret_is_a_configuration_error() {
        let mut cfg = config();
        cfg.hash_secret = String::new();
        let result = GatewayUrlBuilder::new(
            Arc::new(cfg),
            Arc::new(InMemoryOrderDirectory::new()),
            Arc::new(InMemoryPaymentRecordStore::new()),
        );
        assert!(matches!(result, Err(PaymentError::ConfigurationError { .. })));
    }

    #[test]
    fn loopback_forms_collapse() {
        assert_eq!(normalize_ip("::1"), "127.0.0.1");
        assert_eq!(normalize_ip("::ffff:127.0.0.1"), "127.0.0.1");
        assert_eq!(normalize_ip("127.0.1.1"), "127.0.0.1");
        assert_eq!(normalize_ip("::ffff:203.0.113.7"), "203.0.113.7");
        assert_eq!(normalize_ip("203.0.113.7, 10.0.0.1"), "203.0.113.7");
        assert_eq!(normalize_ip("2001:db8::1"), "2001:db8::1");
    }
}
