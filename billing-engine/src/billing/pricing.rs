//! Pricing catalog.
//!
//! Pure lookups of registration and recurring fees per role, package and
//! institution type. Amounts are in the smallest currency unit.

use crate::models::{InstitutionType, Role};

use super::period::BillingCycle;

/// Known package tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageType {
    Basic,
    Standard,
    Premium,
    Ctm,
    Lifetime,
}

impl PackageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageType::Basic => "basic",
            PackageType::Standard => "standard",
            PackageType::Premium => "premium",
            PackageType::Ctm => "ctm",
            PackageType::Lifetime => "lifetime",
        }
    }

    /// Parse a stored package string. Unknown packages yield `None`.
    pub fn from_string(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Some(PackageType::Basic),
            "standard" => Some(PackageType::Standard),
            "premium" => Some(PackageType::Premium),
            "ctm" => Some(PackageType::Ctm),
            "lifetime" => Some(PackageType::Lifetime),
            _ => None,
        }
    }

    pub fn all() -> [PackageType; 5] {
        [
            PackageType::Basic,
            PackageType::Standard,
            PackageType::Premium,
            PackageType::Ctm,
            PackageType::Lifetime,
        ]
    }

    pub fn cycle(&self) -> Option<BillingCycle> {
        match self {
            PackageType::Basic | PackageType::Standard | PackageType::Premium => {
                Some(BillingCycle::Monthly)
            }
            PackageType::Ctm => Some(BillingCycle::Annual),
            PackageType::Lifetime => None,
        }
    }
}

struct PackagePrices {
    student_government: i64,
    student_private: i64,
    general: i64,
    recurring_student: Option<i64>,
    recurring_general: Option<i64>,
}

const fn prices(package: PackageType) -> PackagePrices {
    match package {
        PackageType::Basic => PackagePrices {
            student_government: 50_000,
            student_private: 75_000,
            general: 100_000,
            recurring_student: Some(20_000),
            recurring_general: Some(30_000),
        },
        PackageType::Standard => PackagePrices {
            student_government: 75_000,
            student_private: 110_000,
            general: 150_000,
            recurring_student: Some(30_000),
            recurring_general: Some(45_000),
        },
        PackageType::Premium => PackagePrices {
            student_government: 100_000,
            student_private: 150_000,
            general: 200_000,
            recurring_student: Some(50_000),
            recurring_general: Some(70_000),
        },
        PackageType::Ctm => PackagePrices {
            student_government: 120_000,
            student_private: 180_000,
            general: 240_000,
            recurring_student: Some(240_000),
            recurring_general: Some(360_000),
        },
        PackageType::Lifetime => PackagePrices {
            student_government: 300_000,
            student_private: 450_000,
            general: 500_000,
            recurring_student: None,
            recurring_general: None,
        },
    }
}

/// Registration fee charged to an unknown package.
pub const DEFAULT_REGISTRATION_FEE: i64 = prices(PackageType::Basic).student_government;

/// Fee lookups. Stateless; cheap to copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct PricingCatalog;

impl PricingCatalog {
    pub fn new() -> Self {
        Self
    }

    /// One-time registration fee. Unknown packages fall back to the basic
    /// government student fee.
    pub fn registration_fee(
        &self,
        role: Role,
        package_type: &str,
        institution: InstitutionType,
    ) -> i64 {
        if !role.requires_payment() {
            return 0;
        }
        let Some(package) = PackageType::from_string(package_type) else {
            return DEFAULT_REGISTRATION_FEE;
        };
        let p = prices(package);
        match (role, institution) {
            (Role::Student, InstitutionType::Government) => p.student_government,
            (Role::Student, InstitutionType::Private) => p.student_private,
            _ => p.general,
        }
    }

    fn recurring_amount(&self, role: Role, package: PackageType) -> Option<i64> {
        if !role.requires_payment() {
            return None;
        }
        let p = prices(package);
        match role {
            Role::Student => p.recurring_student,
            _ => p.recurring_general,
        }
    }

    /// Monthly fee, for monthly packages only.
    pub fn monthly_fee(&self, role: Role, package_type: &str) -> Option<i64> {
        let package = PackageType::from_string(package_type)?;
        match package.cycle()? {
            BillingCycle::Monthly => self.recurring_amount(role, package),
            BillingCycle::Annual => None,
        }
    }

    /// Annual fee, for annual packages only.
    pub fn annual_fee(&self, role: Role, package_type: &str) -> Option<i64> {
        let package = PackageType::from_string(package_type)?;
        match package.cycle()? {
            BillingCycle::Annual => self.recurring_amount(role, package),
            BillingCycle::Monthly => None,
        }
    }

    pub fn has_recurring_billing(&self, package_type: &str) -> bool {
        self.billing_cycle(package_type).is_some()
    }

    pub fn billing_cycle(&self, package_type: &str) -> Option<BillingCycle> {
        PackageType::from_string(package_type).and_then(|p| p.cycle())
    }

    /// Cycle and amount of the recurring charge, if the pair is billed.
    pub fn recurring_fee(&self, role: Role, package_type: &str) -> Option<(BillingCycle, i64)> {
        let package = PackageType::from_string(package_type)?;
        let cycle = package.cycle()?;
        self.recurring_amount(role, package)
            .map(|amount| (cycle, amount))
    }

    /// Package strings with recurring billing, as stored on accounts.
    pub fn recurring_packages(&self) -> Vec<&'static str> {
        PackageType::all()
            .into_iter()
            .filter(|p| p.cycle().is_some())
            .map(|p| p.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_fee_by_institution() {
        let catalog = PricingCatalog::new();
        assert_eq!(
            catalog.registration_fee(Role::Student, "basic", InstitutionType::Government),
            50_000
        );
        assert_eq!(
            catalog.registration_fee(Role::Student, "basic", InstitutionType::Private),
            75_000
        );
        assert_eq!(
            catalog.registration_fee(Role::Entrepreneur, "premium", InstitutionType::Private),
            200_000
        );
        assert_eq!(
            catalog.registration_fee(Role::NonStudent, "lifetime", InstitutionType::Government),
            500_000
        );
    }

    #[test]
    fn test_unknown_package_uses_default_fee() {
        let catalog = PricingCatalog::new();
        assert_eq!(
            catalog.registration_fee(Role::Entrepreneur, "gold", InstitutionType::Private),
            50_000
        );
        assert!(!catalog.has_recurring_billing("gold"));
        assert_eq!(catalog.monthly_fee(Role::Student, "gold"), None);
    }

    #[test]
    fn test_exempt_roles_pay_nothing() {
        let catalog = PricingCatalog::new();
        assert_eq!(
            catalog.registration_fee(Role::Teacher, "premium", InstitutionType::Government),
            0
        );
        assert_eq!(catalog.recurring_fee(Role::Admin, "basic"), None);
    }

    #[test]
    fn test_monthly_and_annual_fees() {
        let catalog = PricingCatalog::new();
        assert_eq!(catalog.monthly_fee(Role::Student, "standard"), Some(30_000));
        assert_eq!(catalog.monthly_fee(Role::NonStudent, "premium"), Some(70_000));
        assert_eq!(catalog.monthly_fee(Role::Student, "ctm"), None);
        assert_eq!(catalog.annual_fee(Role::Student, "ctm"), Some(240_000));
        assert_eq!(catalog.annual_fee(Role::Entrepreneur, "ctm"), Some(360_000));
        assert_eq!(catalog.annual_fee(Role::Student, "basic"), None);
    }

    #[test]
    fn test_lifetime_has_no_recurring_billing() {
        let catalog = PricingCatalog::new();
        assert!(!catalog.has_recurring_billing("lifetime"));
        assert_eq!(catalog.recurring_fee(Role::Student, "lifetime"), None);
        assert_eq!(
            catalog.recurring_fee(Role::Student, "CTM"),
            Some((BillingCycle::Annual, 240_000))
        );
    }

    #[test]
    fn test_recurring_packages() {
        let packages = PricingCatalog::new().recurring_packages();
        assert_eq!(packages, vec!["basic", "standard", "premium", "ctm"]);
    }
}
