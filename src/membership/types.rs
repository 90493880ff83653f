use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub active: bool,
    pub is_admin: bool,
    /// Plan the user is subscribed to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when someone registers
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,
    pub plan_name: String,
    /// Monthly amount in cents
    pub plan_amount: i64,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Amount as dollars, e.g. `$30.00`
    pub fn amount_formatted(&self) -> String {
        let sign = if self.plan_amount < 0 { "-" } else { "" };
        let cents = self.plan_amount.unsigned_abs();
        format!("{}${}.{:02}", sign, cents / 100, cents % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_formatted() {
        let mut plan = Plan {
            id: 1,
            plan_name: "Bronze Plan".to_string(),
            plan_amount: 1000,
            created_at: Utc::now(),
        };
        assert_eq!(plan.amount_formatted(), "$10.00");

        plan.plan_amount = 1999;
        assert_eq!(plan.amount_formatted(), "$19.99");

        plan.plan_amount = 5;
        assert_eq!(plan.amount_formatted(), "$0.05");
    }
}
