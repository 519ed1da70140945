//! Classification and routing table.
//!
//! Every inbound event kind is described by one [`KindRule`]: the payload
//! fields it must carry, which roles may see it, the per-role scope checks
//! that narrow it further, and the category it files under. The engine is
//! parameterized by a [`RoutingTable`] of such rules instead of per-kind code.

use serde::{Deserialize, Serialize};

use super::envelope::EventEnvelope;
use super::model::{Category, RelatedIds, Severity};

/// Role of the signed-in viewer.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Role {
    Admin,
    Branch,
    Production,
    Chef,
}

/// Identity and tenant scope of the viewer on whose behalf events are judged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerScope {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chef_id: Option<String>,
    pub user_id: String,
}

impl ViewerScope {
    pub fn new(role: Role, user_id: impl Into<String>) -> Self {
        Self {
            role,
            branch_id: None,
            department_id: None,
            chef_id: None,
            user_id: user_id.into(),
        }
    }

    pub fn with_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }

    pub fn with_department(mut self, department_id: impl Into<String>) -> Self {
        self.department_id = Some(department_id.into());
        self
    }

    pub fn with_chef(mut self, chef_id: impl Into<String>) -> Self {
        self.chef_id = Some(chef_id.into());
        self
    }

    /// The scope identifier the viewer's role cannot work without, if missing.
    pub fn missing_identifier(&self) -> Option<&'static str> {
        if self.user_id.trim().is_empty() {
            return Some("userId");
        }
        match self.role {
            Role::Branch if is_blank(&self.branch_id) => Some("branchId"),
            Role::Production if is_blank(&self.department_id) => Some("departmentId"),
            Role::Chef if is_blank(&self.chef_id) => Some("chefId"),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing_identifier().is_none()
    }

    /// Rooms this viewer subscribes to on the transport.
    pub fn rooms(&self) -> Vec<String> {
        let mut rooms = vec![
            format!("role:{}", self.role),
            format!("user:{}", self.user_id),
        ];
        if let Some(id) = &self.branch_id {
            rooms.push(format!("branch:{}", id));
        }
        if let Some(id) = &self.department_id {
            rooms.push(format!("department:{}", id));
        }
        if let Some(id) = &self.chef_id {
            rooms.push(format!("chef:{}", id));
        }
        rooms
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

/// A scope test applied for one role on top of the audience list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeCheck {
    /// The event's branch hint must equal the viewer's branch.
    Branch,
    /// Like [`ScopeCheck::Branch`], but an event without a branch hint passes.
    BranchIfHinted,
    /// The event's chef hint must equal the viewer's chef.
    Chef,
    ChefIfHinted,
    DepartmentIfHinted,
    /// At least one order line item must belong to the viewer's department.
    LineItemDepartment,
}

impl ScopeCheck {
    fn passes(self, envelope: &EventEnvelope, scope: &ViewerScope) -> bool {
        let hints = &envelope.scope_hints;
        match self {
            Self::Branch => matches_required(&hints.branch_id, &scope.branch_id),
            Self::BranchIfHinted => matches_if_hinted(&hints.branch_id, &scope.branch_id),
            Self::Chef => matches_required(&hints.chef_id, &scope.chef_id),
            Self::ChefIfHinted => matches_if_hinted(&hints.chef_id, &scope.chef_id),
            Self::DepartmentIfHinted => {
                matches_if_hinted(&hints.department_id, &scope.department_id)
            }
            Self::LineItemDepartment => match &scope.department_id {
                Some(department) => envelope
                    .line_item_departments()
                    .iter()
                    .any(|d| d == department),
                None => false,
            },
        }
    }
}

fn matches_required(hint: &Option<String>, viewer: &Option<String>) -> bool {
    match (hint, viewer) {
        (Some(hint), Some(viewer)) => hint == viewer,
        _ => false,
    }
}

fn matches_if_hinted(hint: &Option<String>, viewer: &Option<String>) -> bool {
    match hint {
        None => true,
        Some(hint) => viewer.as_deref() == Some(hint.as_str()),
    }
}

/// Declarative description of one event kind.
#[derive(Debug, Clone, Copy)]
pub struct KindRule {
    /// Canonical kind name.
    pub kind: &'static str,
    /// Additional accepted spellings (legacy socket event names).
    pub aliases: &'static [&'static str],
    pub required_fields: &'static [&'static str],
    /// Roles that may see this kind at all.
    pub audience: &'static [Role],
    /// Extra checks per role; every check listed for the viewer's role must pass.
    pub constraints: &'static [(Role, ScopeCheck)],
    /// Fixed category, or `None` to derive it from the related ids.
    pub category: Option<Category>,
    pub default_severity: Severity,
    /// Whether a `status` payload field refines the severity.
    pub status_severity: bool,
}

const ALL_ROLES: &[Role] = &[Role::Admin, Role::Branch, Role::Production, Role::Chef];
const ORDER_AUDIENCE: &[Role] = &[Role::Admin, Role::Branch, Role::Production];
const TASK_AUDIENCE: &[Role] = &[Role::Admin, Role::Production, Role::Chef];
const SALE_AUDIENCE: &[Role] = &[Role::Admin, Role::Branch];

const TASK_CONSTRAINTS: &[(Role, ScopeCheck)] = &[
    (Role::Chef, ScopeCheck::Chef),
    (Role::Production, ScopeCheck::DepartmentIfHinted),
];
const BRANCH_ONLY: &[(Role, ScopeCheck)] = &[(Role::Branch, ScopeCheck::Branch)];

const KIND_RULES: &[KindRule] = &[
    KindRule {
        kind: "order.created",
        aliases: &["newOrder", "newOrderFromBranch"],
        required_fields: &["orderId", "orderNumber", "branchId"],
        audience: ORDER_AUDIENCE,
        constraints: &[
            (Role::Branch, ScopeCheck::Branch),
            (Role::Production, ScopeCheck::LineItemDepartment),
        ],
        category: Some(Category::Orders),
        default_severity: Severity::Success,
        status_severity: false,
    },
    KindRule {
        kind: "order.statusChanged",
        aliases: &["orderStatusUpdated", "orderStatusChanged"],
        required_fields: &["orderId", "status"],
        audience: ORDER_AUDIENCE,
        constraints: BRANCH_ONLY,
        category: Some(Category::Orders),
        default_severity: Severity::Info,
        status_severity: true,
    },
    KindRule {
        kind: "task.assigned",
        aliases: &["taskAssigned"],
        required_fields: &["orderId", "taskId", "chefId", "productName", "quantity"],
        audience: TASK_AUDIENCE,
        constraints: TASK_CONSTRAINTS,
        category: Some(Category::ProductionTasks),
        default_severity: Severity::Info,
        status_severity: false,
    },
    KindRule {
        kind: "task.started",
        aliases: &["taskStarted"],
        required_fields: &["taskId", "orderId"],
        audience: TASK_AUDIENCE,
        constraints: TASK_CONSTRAINTS,
        category: Some(Category::ProductionTasks),
        default_severity: Severity::Info,
        status_severity: false,
    },
    KindRule {
        kind: "task.completed",
        aliases: &["taskCompleted"],
        required_fields: &["taskId", "orderId"],
        audience: TASK_AUDIENCE,
        constraints: TASK_CONSTRAINTS,
        category: Some(Category::ProductionTasks),
        default_severity: Severity::Success,
        status_severity: false,
    },
    KindRule {
        kind: "return.created",
        aliases: &["returnCreated", "newReturn"],
        required_fields: &["returnId", "branchId"],
        audience: ORDER_AUDIENCE,
        constraints: BRANCH_ONLY,
        category: Some(Category::Returns),
        default_severity: Severity::Warning,
        status_severity: false,
    },
    KindRule {
        kind: "return.statusChanged",
        aliases: &["returnStatusUpdated", "returnStatusChanged"],
        required_fields: &["returnId", "branchId", "status"],
        audience: ORDER_AUDIENCE,
        constraints: BRANCH_ONLY,
        category: Some(Category::Returns),
        default_severity: Severity::Info,
        status_severity: true,
    },
    KindRule {
        kind: "sale.created",
        aliases: &["saleCreated", "newSale"],
        required_fields: &["saleId", "branchId"],
        audience: SALE_AUDIENCE,
        constraints: BRANCH_ONLY,
        category: Some(Category::Sales),
        default_severity: Severity::Success,
        status_severity: false,
    },
    KindRule {
        kind: "notification.new",
        aliases: &["newNotification"],
        required_fields: &["message"],
        audience: ALL_ROLES,
        constraints: &[
            (Role::Branch, ScopeCheck::BranchIfHinted),
            (Role::Chef, ScopeCheck::ChefIfHinted),
            (Role::Production, ScopeCheck::DepartmentIfHinted),
        ],
        category: None,
        default_severity: Severity::Info,
        status_severity: false,
    },
];

/// Outcome of classifying a relevant event for a viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: Category,
    pub route: Option<&'static str>,
    pub severity: Severity,
}

/// The classification table the engine runs on.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    rules: Vec<KindRule>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new(KIND_RULES.to_vec())
    }
}

impl RoutingTable {
    pub fn new(rules: Vec<KindRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[KindRule] {
        &self.rules
    }

    /// Kinds the engine subscribes to on the transport.
    pub fn subscribed_kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().map(|r| r.kind)
    }

    pub fn rule(&self, kind: &str) -> Option<&KindRule> {
        self.rules.iter().find(|r| r.kind == kind)
    }

    /// Map an inbound kind spelling (`task.assigned`, `taskAssigned`,
    /// `task_assigned`, ...) onto its canonical kind.
    pub fn canonicalize_kind(&self, input: &str) -> Option<&'static str> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return None;
        }

        let normalized_input = normalize_kind_key(trimmed);
        for rule in &self.rules {
            if normalize_kind_key(rule.kind) == normalized_input {
                return Some(rule.kind);
            }
            for alias in rule.aliases {
                if normalize_kind_key(alias) == normalized_input {
                    return Some(rule.kind);
                }
            }
        }

        None
    }

    /// Required payload fields for a kind. Unmapped kinds require nothing.
    pub fn required_fields(&self, kind: &str) -> &[&'static str] {
        self.rule(kind).map(|r| r.required_fields).unwrap_or(&[])
    }

    /// Whether the event concerns this viewer.
    ///
    /// Unmapped kinds are visible to every role; they classify as generic and
    /// never reach a badge.
    pub fn is_relevant(&self, envelope: &EventEnvelope, scope: &ViewerScope) -> bool {
        let Some(rule) = self.rule(&envelope.kind) else {
            return true;
        };

        if !rule.audience.contains(&scope.role) {
            return false;
        }

        rule.constraints
            .iter()
            .filter(|(role, _)| *role == scope.role)
            .all(|(_, check)| check.passes(envelope, scope))
    }

    /// Classify an event for a viewer, or `None` if it is not relevant.
    pub fn classify(&self, envelope: &EventEnvelope, scope: &ViewerScope) -> Option<Classification> {
        if !self.is_relevant(envelope, scope) {
            return None;
        }

        let rule = self.rule(&envelope.kind);
        let category = match rule {
            Some(KindRule {
                category: Some(category),
                ..
            }) => *category,
            Some(_) => category_from_ids(&envelope.related_ids()),
            None => Category::Generic,
        };

        Some(Classification {
            category,
            route: route_for(category, scope.role),
            severity: severity_for(rule, envelope),
        })
    }
}

fn normalize_kind_key(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| !matches!(c, '.' | '_' | '-' | ' '))
        .collect()
}

/// Category from related ids alone, for kinds without a declared category.
pub fn category_from_ids(ids: &RelatedIds) -> Category {
    if ids.order_id.is_some() && ids.task_id.is_none() {
        Category::Orders
    } else if ids.task_id.is_some() {
        Category::ProductionTasks
    } else if ids.return_id.is_some() {
        Category::Returns
    } else if ids.sale_id.is_some() {
        Category::Sales
    } else {
        Category::Generic
    }
}

/// UI route whose badge an unread notification of `category` feeds.
pub fn route_for(category: Category, role: Role) -> Option<&'static str> {
    let route = match (category, role) {
        (Category::Orders, Role::Branch) => "/branch-orders",
        (Category::Orders, _) => "/orders",
        (Category::ProductionTasks, Role::Chef) => "/chef-tasks",
        (Category::ProductionTasks, _) => "/production-tasks",
        (Category::Returns, Role::Branch) => "/branch-returns",
        (Category::Returns, _) => "/returns",
        (Category::Sales, Role::Branch) => "/branch-sales",
        (Category::Sales, _) => "/sales",
        (Category::Generic, _) => return None,
    };
    Some(route)
}

fn severity_for(rule: Option<&KindRule>, envelope: &EventEnvelope) -> Severity {
    let explicit = ["severity", "type"]
        .iter()
        .filter_map(|key| envelope.payload.get(*key).and_then(|v| v.as_str()))
        .find_map(Severity::parse);
    if let Some(severity) = explicit {
        return severity;
    }

    let Some(rule) = rule else {
        return Severity::Info;
    };

    if rule.status_severity {
        let status = envelope
            .payload
            .get("status")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_ascii_lowercase());
        match status.as_deref() {
            Some("approved" | "completed" | "delivered" | "accepted") => return Severity::Success,
            Some("rejected" | "cancelled" | "canceled") => return Severity::Warning,
            Some("failed") => return Severity::Error,
            _ => {}
        }
    }

    rule.default_severity
}
