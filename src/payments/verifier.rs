//! Inbound callback verification.
//!
//! The gateway reports outcomes twice: through the shopper's browser on the
//! return URL and server-to-server on the IPN URL. Both arrive as the same
//! query parameters and go through [`CallbackVerifier::verify`], which only
//! reads. State changes belong to the settlement coordinator.

use crate::database::payment_record_repository::PaymentRecordStore;
use crate::logging::mask_reference;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::signer::{SignableParams, Signer};
use crate::payments::types::{PaymentRecord, GATEWAY_SUCCESS_CODE};
use bigdecimal::BigDecimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

const PROTOCOL_PREFIX: &str = "vnp_";
const SECURE_HASH: &str = "vnp_SecureHash";
const SECURE_HASH_TYPE: &str = "vnp_SecureHashType";

/// Parameters of a gateway callback.
///
/// Known fields are typed; any other protocol field lands in `extra` so it is
/// still covered by the signature. Parameters without the protocol prefix
/// are not part of the signed set and are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub tmn_code: Option<String>,
    pub amount: Option<String>,
    pub bank_code: Option<String>,
    pub bank_tran_no: Option<String>,
    pub card_type: Option<String>,
    pub order_info: Option<String>,
    pub pay_date: Option<String>,
    pub response_code: Option<String>,
    pub transaction_no: Option<String>,
    pub transaction_status: Option<String>,
    pub txn_ref: Option<String>,
    pub extra: BTreeMap<String, String>,
    pub secure_hash: Option<String>,
    pub secure_hash_type: Option<String>,
}

impl CallbackParams {
    /// Build from decoded query pairs. A repeated key keeps its last value.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut params = CallbackParams::default();
        for (key, value) in pairs {
            let key: String = key.into();
            let value = Some(value.into());
            match key.as_str() {
                "vnp_TmnCode" => params.tmn_code = value,
                "vnp_Amount" => params.amount = value,
                "vnp_BankCode" => params.bank_code = value,
                "vnp_BankTranNo" => params.bank_tran_no = value,
                "vnp_CardType" => params.card_type = value,
                "vnp_OrderInfo" => params.order_info = value,
                "vnp_PayDate" => params.pay_date = value,
                "vnp_ResponseCode" => params.response_code = value,
                "vnp_TransactionNo" => params.transaction_no = value,
                "vnp_TransactionStatus" => params.transaction_status = value,
                "vnp_TxnRef" => params.txn_ref = value,
                SECURE_HASH => params.secure_hash = value,
                SECURE_HASH_TYPE => params.secure_hash_type = value,
                other if other.starts_with(PROTOCOL_PREFIX) => {
                    if let Some(v) = value {
                        params.extra.insert(other.to_string(), v);
                    }
                }
                _ => {}
            }
        }
        params
    }

    pub fn reference(&self) -> &str {
        self.txn_ref.as_deref().unwrap_or("")
    }
}

impl SignableParams for CallbackParams {
    fn signing_pairs(&self) -> Vec<(String, Option<String>)> {
        let mut pairs = vec![
            ("vnp_TmnCode".to_string(), self.tmn_code.clone()),
            ("vnp_Amount".to_string(), self.amount.clone()),
            ("vnp_BankCode".to_string(), self.bank_code.clone()),
            ("vnp_BankTranNo".to_string(), self.bank_tran_no.clone()),
            ("vnp_CardType".to_string(), self.card_type.clone()),
            ("vnp_OrderInfo".to_string(), self.order_info.clone()),
            ("vnp_PayDate".to_string(), self.pay_date.clone()),
            ("vnp_ResponseCode".to_string(), self.response_code.clone()),
            ("vnp_TransactionNo".to_string(), self.transaction_no.clone()),
            (
                "vnp_TransactionStatus".to_string(),
                self.transaction_status.clone(),
            ),
            ("vnp_TxnRef".to_string(), self.txn_ref.clone()),
        ];
        pairs.extend(
            self.extra
                .iter()
                .map(|(k, v)| (k.clone(), Some(v.clone()))),
        );
        pairs
    }
}

/// Why a callback was judged forged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForgeryReason {
    SignatureMismatch,
    MerchantMismatch { reported: String },
    AmountMismatch { expected: String, reported: String },
}

impl ForgeryReason {
    /// Merchant mismatches are reported as signature mismatches
    pub fn into_error(self, reference: &str) -> PaymentError {
        match self {
            ForgeryReason::AmountMismatch { expected, reported } => PaymentError::AmountMismatch {
                reference: reference.to_string(),
                expected,
                reported,
            },
            ForgeryReason::SignatureMismatch | ForgeryReason::MerchantMismatch { .. } => {
                PaymentError::SignatureMismatch {
                    reference: reference.to_string(),
                }
            }
        }
    }
}

/// A callback whose signature, merchant and amount all check out
#[derive(Debug, Clone)]
pub struct VerifiedCallback {
    pub record: PaymentRecord,
    pub response_code: String,
    pub transaction_status: Option<String>,
    pub gateway_transaction_no: Option<String>,
}

impl VerifiedCallback {
    /// The gateway charged the shopper. A transaction status, when sent, must agree.
    pub fn is_success(&self) -> bool {
        self.response_code == GATEWAY_SUCCESS_CODE
            && self
                .transaction_status
                .as_deref()
                .map_or(true, |status| status == GATEWAY_SUCCESS_CODE)
    }

    pub fn reference(&self) -> &str {
        self.record.transaction_reference.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone)]
pub enum Verification {
    Authentic(VerifiedCallback),
    Forged {
        reason: ForgeryReason,
        reference: String,
        /// Record the callback points at, when it exists
        record: Option<PaymentRecord>,
        gateway_transaction_no: Option<String>,
    },
    /// Valid signature for a reference this service never issued
    Unknown { reference: String },
}

impl Verification {
    /// The failure this verification represents, if any.
    /// A gateway-reported failure is not included; it needs the coordinator.
    pub fn rejection(&self) -> Option<PaymentError> {
        match self {
            Verification::Authentic(_) => None,
            Verification::Forged {
                reason, reference, ..
            } => Some(reason.clone().into_error(reference)),
            Verification::Unknown { reference } => {
                Some(PaymentError::UnknownTransactionReference {
                    reference: reference.clone(),
                })
            }
        }
    }
}

pub struct CallbackVerifier {
    signer: Signer,
    tmn_code: String,
    records: Arc<dyn PaymentRecordStore>,
}

impl CallbackVerifier {
    pub fn new(
        hash_secret: &str,
        tmn_code: impl Into<String>,
        records: Arc<dyn PaymentRecordStore>,
    ) -> PaymentResult<Self> {
        Ok(Self {
            signer: Signer::new(hash_secret)?,
            tmn_code: tmn_code.into(),
            records,
        })
    }

    /// Classify a callback. Errors only when the record lookup itself fails.
    pub async fn verify(&self, params: &CallbackParams) -> PaymentResult<Verification> {
        let reference = params.reference().to_string();
        let supplied = params.secure_hash.as_deref().unwrap_or("");
        let (signature_valid, recomputed) = self.signer.verify_params(params, supplied);

        let record = if reference.is_empty() {
            None
        } else {
            self.records.find_by_reference(&reference).await?
        };

        if !signature_valid {
            warn!(
                transaction_reference = %mask_reference(&reference),
                canonical = %recomputed.canonical,
                supplied_signature = %supplied,
                recomputed_signature = %recomputed.signature,
                "Callback signature mismatch"
            );
            return Ok(Verification::Forged {
                reason: ForgeryReason::SignatureMismatch,
                reference,
                record,
                gateway_transaction_no: None,
            });
        }

        let Some(record) = record else {
            warn!(
                transaction_reference = %mask_reference(&reference),
                "Signed callback for unknown transaction reference"
            );
            return Ok(Verification::Unknown { reference });
        };

        let reported_merchant = params.tmn_code.clone().unwrap_or_default();
        if reported_merchant != self.tmn_code {
            warn!(
                transaction_reference = %mask_reference(&reference),
                reported_merchant = %reported_merchant,
                "Callback merchant code does not match configuration"
            );
            return Ok(Verification::Forged {
                reason: ForgeryReason::MerchantMismatch {
                    reported: reported_merchant,
                },
                reference,
                record: Some(record),
                gateway_transaction_no: params.transaction_no.clone(),
            });
        }

        let expected = record.amount_minor_units();
        let reported = params.amount.clone().unwrap_or_default();
        if !amounts_agree(&expected, &reported) {
            warn!(
                transaction_reference = %mask_reference(&reference),
                expected_amount = %expected,
                reported_amount = %reported,
                canonical = %recomputed.canonical,
                supplied_signature = %supplied,
                recomputed_signature = %recomputed.signature,
                "Callback amount does not match payment record"
            );
            return Ok(Verification::Forged {
                reason: ForgeryReason::AmountMismatch { expected, reported },
                reference,
                record: Some(record),
                gateway_transaction_no: params.transaction_no.clone(),
            });
        }

        debug!(
            transaction_reference = %mask_reference(&reference),
            response_code = params.response_code.as_deref().unwrap_or(""),
            "Callback verified"
        );

        Ok(Verification::Authentic(VerifiedCallback {
            record,
            response_code: params.response_code.clone().unwrap_or_default(),
            transaction_status: params.transaction_status.clone(),
            gateway_transaction_no: params.transaction_no.clone(),
        }))
    }
}

/// Compare minor-unit amounts numerically so `"0150"` and `"150"` agree
fn amounts_agree(expected: &str, reported: &str) -> bool {
    match (BigDecimal::from_str(expected), BigDecimal::from_str(reported)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
