//! Order state machine.
//!
//! ```text
//! pending -> paid -> processing -> shipped -> delivered
//!    |        |
//!    +--------+--> cancelled
//! ```
//!
//! Both entry points are pure; persisting the result is the caller's job.

use serde::Serialize;

use crate::entities::order::OrderStatus;
use crate::errors::ServiceError;

/// Payment provider event kinds the reconciler acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PaymentEventKind {
    AuthorizationCreated,
    AuthorizationSucceeded,
    ChargeSucceeded,
    AuthorizationFailed,
    AuthorizationCanceled,
}

impl PaymentEventKind {
    /// Maps a provider event type; `None` for types this service does not handle.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "payment_intent.created" => Some(Self::AuthorizationCreated),
            "payment_intent.succeeded" => Some(Self::AuthorizationSucceeded),
            "charge.succeeded" => Some(Self::ChargeSucceeded),
            "payment_intent.payment_failed" => Some(Self::AuthorizationFailed),
            "payment_intent.canceled" => Some(Self::AuthorizationCanceled),
            _ => None,
        }
    }

    /// Whether the event reports money moving in the merchant's favour.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::AuthorizationSucceeded | Self::ChargeSucceeded
        )
    }
}

struct Rule {
    allowed_from: &'static [OrderStatus],
    to: Option<OrderStatus>,
}

fn rule_for(kind: PaymentEventKind) -> Rule {
    use OrderStatus::*;

    match kind {
        // Only records the reference; status stays put
        PaymentEventKind::AuthorizationCreated => Rule {
            allowed_from: &[Pending],
            to: None,
        },
        PaymentEventKind::AuthorizationSucceeded => Rule {
            allowed_from: &[Pending],
            to: Some(Paid),
        },
        PaymentEventKind::ChargeSucceeded => Rule {
            allowed_from: &[Pending, Paid],
            to: Some(Paid),
        },
        PaymentEventKind::AuthorizationFailed | PaymentEventKind::AuthorizationCanceled => Rule {
            allowed_from: &[Pending],
            to: Some(Cancelled),
        },
    }
}

/// Outcome of applying an event or admin action to a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: OrderStatus,
    pub to: OrderStatus,
}

impl Transition {
    pub fn changes_status(&self) -> bool {
        self.from != self.to
    }
}

/// Resolves what a payment event does to an order in `current`.
pub fn transition_for_event(
    current: OrderStatus,
    kind: PaymentEventKind,
) -> Result<Transition, ServiceError> {
    if current.is_terminal() {
        return Err(ServiceError::TerminalState { status: current });
    }

    let rule = rule_for(kind);
    if !rule.allowed_from.contains(&current) {
        return Err(ServiceError::InvalidTransition {
            from: current,
            attempted: kind.to_string(),
        });
    }

    Ok(Transition {
        from: current,
        to: rule.to.unwrap_or(current),
    })
}

/// Validates an operator-requested move to `target`.
pub fn admin_transition(
    current: OrderStatus,
    target: OrderStatus,
) -> Result<Transition, ServiceError> {
    use OrderStatus::*;

    if current.is_terminal() {
        return Err(ServiceError::TerminalState { status: current });
    }

    let allowed = match (current, target) {
        (Paid, Processing) | (Processing, Shipped) | (Shipped, Delivered) => true,
        (_, Cancelled) => true,
        _ => false,
    };

    if !allowed {
        return Err(ServiceError::InvalidTransition {
            from: current,
            attempted: format!("admin change to '{}'", target),
        });
    }

    Ok(Transition {
        from: current,
        to: target,
    })
}
