use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{entities::customer, errors::ServiceError};

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Customer identities used by checkout.
#[derive(Clone)]
pub struct CustomerService {
    db: Arc<DatabaseConnection>,
}

impl CustomerService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Returns the oldest guest account for `email`, creating one if none
    /// exists. Registered accounts with the same email are never returned.
    #[instrument(skip(self, email))]
    pub async fn resolve_guest(&self, email: &str) -> Result<customer::Model, ServiceError> {
        let db = &*self.db;
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(ServiceError::ValidationError("email is required".into()));
        }

        if let Some(existing) = customer::Entity::find()
            .filter(customer::Column::Email.eq(email.as_str()))
            .filter(customer::Column::IsGuest.eq(true))
            .order_by_asc(customer::Column::CreatedAt)
            .one(db)
            .await?
        {
            return Ok(existing);
        }

        let created = customer::ActiveModel {
            id: Set(Uuid::new_v4()),
            email: Set(email),
            is_guest: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(db)
        .await?;

        info!(customer_id = %created.id, "guest customer created");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_email;

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(normalize_email("  Shopper@Example.COM "), "shopper@example.com");
    }
}
