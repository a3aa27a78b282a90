use buddy_types::{Capability, Intent, Step, StepId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::StepScheduler;

const FALLBACK_CATEGORY: &str = "ask";
const SUMMARY_INTENT_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("plan has no steps")]
    Empty,
    #[error("duplicate step id `{0}`")]
    DuplicateStep(String),
    #[error("step `{step_id}` depends on unknown step `{dependency}`")]
    UnknownDependency { step_id: String, dependency: String },
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("no plan rule for intent category `{0}`")]
    UnknownCategory(String),
}

/// Template for one step of a rule. `key` becomes the step id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    pub key: String,
    pub capability: Capability,
    pub operation: String,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default = "default_true")]
    pub user_visible: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Shown to the approver; `{intent}` is replaced with the intent text.
    #[serde(default)]
    pub summary: String,
}

fn default_true() -> bool {
    true
}

impl StepTemplate {
    pub fn new(key: &str, capability: Capability, operation: &str) -> Self {
        Self {
            key: key.to_string(),
            capability,
            operation: operation.to_string(),
            sensitive: false,
            user_visible: true,
            depends_on: Vec::new(),
            summary: String::new(),
        }
    }

    pub fn sensitive(mut self, summary: &str) -> Self {
        self.sensitive = true;
        self.summary = summary.to_string();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.user_visible = false;
        self
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

/// Maps an intent category to the step templates that fulfil it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRule {
    pub category: String,
    /// Lowercase phrases that select this rule when the intent names no category.
    #[serde(default)]
    pub keywords: Vec<String>,
    pub steps: Vec<StepTemplate>,
}

impl PlanRule {
    fn new(category: &str, keywords: &[&str], steps: Vec<StepTemplate>) -> Self {
        Self {
            category: category.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            steps,
        }
    }

    fn matches(&self, text: &str) -> bool {
        self.keywords.iter().any(|keyword| text.contains(keyword.as_str()))
    }
}

pub fn default_rules() -> Vec<PlanRule> {
    use Capability::*;
    vec![
        PlanRule::new(
            "send_check_in",
            &["check-in", "check in", "checkin", "send message", "message to", "write to"],
            vec![
                StepTemplate::new("lookup", Grounding, "lookup_contact").hidden(),
                StepTemplate::new("send", Mail, "send_message")
                    .sensitive("Send message: {intent}")
                    .after(&["lookup"]),
            ],
        ),
        PlanRule::new(
            "schedule_event",
            &["schedule", "meeting", "appointment", "book ", "calendar"],
            vec![
                StepTemplate::new("context", Grounding, "resolve_context").hidden(),
                StepTemplate::new("slots", Calendar, "find_slots"),
                StepTemplate::new("create", Calendar, "create_event")
                    .sensitive("Create calendar event: {intent}")
                    .after(&["context", "slots"]),
            ],
        ),
        PlanRule::new(
            "triage_mail",
            &["inbox", "triage", "unread", "emails"],
            vec![
                StepTemplate::new("triage", Mail, "triage_inbox"),
                StepTemplate::new("actions", AssignmentTracker, "extract_action_items")
                    .after(&["triage"]),
            ],
        ),
        PlanRule::new(
            "track_assignment",
            &["assignment", "homework", "due ", "deadline"],
            vec![
                StepTemplate::new("course", Grounding, "lookup_course").hidden(),
                StepTemplate::new("upsert", AssignmentTracker, "upsert_assignment")
                    .sensitive("Record assignment: {intent}")
                    .after(&["course"]),
            ],
        ),
        PlanRule::new(
            "day_plan",
            &["my day", "today", "agenda", "day plan"],
            vec![
                StepTemplate::new("events", Calendar, "list_events"),
                StepTemplate::new("mail", Mail, "triage_inbox"),
                StepTemplate::new("assignments", AssignmentTracker, "list_open"),
            ],
        ),
        PlanRule::new(
            FALLBACK_CATEGORY,
            &[],
            vec![StepTemplate::new("answer", Grounding, "answer")],
        ),
    ]
}

/// A validated plan ready to be installed on a task.
#[derive(Debug, Clone)]
pub struct Plan {
    pub category: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone)]
pub struct Planner {
    rules: Vec<PlanRule>,
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl Planner {
    pub fn new(rules: Vec<PlanRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[PlanRule] {
        &self.rules
    }

    /// Explicit category wins; otherwise first keyword match in rule order, then `ask`.
    pub fn classify(&self, intent: &Intent) -> Result<&PlanRule, PlanError> {
        if let Some(category) = intent.category.as_deref() {
            return self
                .find(category)
                .ok_or_else(|| PlanError::UnknownCategory(category.to_string()));
        }
        let text = intent.text_content().unwrap_or_default().to_lowercase();
        if let Some(rule) = self.rules.iter().find(|rule| rule.matches(&text)) {
            return Ok(rule);
        }
        self.find(FALLBACK_CATEGORY)
            .ok_or_else(|| PlanError::UnknownCategory(FALLBACK_CATEGORY.to_string()))
    }

    pub fn plan(&self, intent: &Intent) -> Result<Plan, PlanError> {
        let rule = self.classify(intent)?;
        let intent_text = intent
            .text_content()
            .map(|text| truncate(text, SUMMARY_INTENT_CHARS))
            .unwrap_or_default();

        let steps: Vec<Step> = rule
            .steps
            .iter()
            .map(|template| {
                let mut step = Step::new(
                    template.key.as_str(),
                    template.capability,
                    template.operation.as_str(),
                );
                step.request = json!({
                    "operation": template.operation,
                    "intent": intent.payload,
                    "inputs": {},
                });
                step.sensitive = template.sensitive;
                step.user_visible = template.user_visible;
                step.depends_on = template
                    .depends_on
                    .iter()
                    .map(|dep| StepId::new(dep.as_str()))
                    .collect();
                step.summary = if template.summary.is_empty() {
                    format!("{} {}", template.capability, template.operation)
                } else {
                    template.summary.replace("{intent}", &intent_text)
                };
                step
            })
            .collect();

        StepScheduler::validate(&steps)?;
        Ok(Plan {
            category: rule.category.clone(),
            steps,
        })
    }

    fn find(&self, category: &str) -> Option<&PlanRule> {
        self.rules.iter().find(|rule| rule.category == category)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_ids(plan: &Plan) -> Vec<&str> {
        plan.steps.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn check_in_plans_lookup_then_gated_send() {
        let plan = Planner::default()
            .plan(&Intent::text("sam", "send check-in message to Alex"))
            .expect("plan");
        assert_eq!(plan.category, "send_check_in");
        assert_eq!(step_ids(&plan), vec!["lookup", "send"]);

        let lookup = &plan.steps[0];
        assert!(!lookup.sensitive);
        assert!(!lookup.user_visible);

        let send = &plan.steps[1];
        assert!(send.sensitive);
        assert_eq!(send.depends_on, vec![StepId::new("lookup")]);
        assert_eq!(send.summary, "Send message: send check-in message to Alex");
        assert_eq!(send.request["operation"], "send_message");
    }

    #[test]
    fn explicit_category_overrides_keywords() {
        let intent = Intent::text("sam", "send check-in message").with_category("day_plan");
        let plan = Planner::default().plan(&intent).expect("plan");
        assert_eq!(plan.category, "day_plan");
        assert_eq!(plan.steps.len(), 3);
        assert!(plan.steps.iter().all(|s| s.depends_on.is_empty()));
    }

    #[test]
    fn unknown_category_is_rejected() {
        let intent = Intent::text("sam", "anything").with_category("teleport");
        let err = Planner::default().plan(&intent).unwrap_err();
        assert_eq!(err, PlanError::UnknownCategory("teleport".to_string()));
    }

    #[test]
    fn unmatched_text_falls_back_to_ask() {
        let plan = Planner::default()
            .plan(&Intent::text("sam", "what is the capital of France?"))
            .expect("plan");
        assert_eq!(plan.category, "ask");
        assert_eq!(step_ids(&plan), vec!["answer"]);
    }

    #[test]
    fn configured_rules_are_validated() {
        let planner = Planner::new(vec![PlanRule::new(
            "ask",
            &[],
            vec![
                StepTemplate::new("a", Capability::Grounding, "answer").after(&["b"]),
                StepTemplate::new("b", Capability::Grounding, "answer").after(&["a"]),
            ],
        )]);
        let err = planner.plan(&Intent::text("sam", "hi")).unwrap_err();
        assert!(matches!(err, PlanError::Cycle { .. }));
    }

    #[test]
    fn long_intents_are_truncated_in_summaries() {
        let text = format!("send check-in {}", "x".repeat(300));
        let plan = Planner::default().plan(&Intent::text("sam", text)).expect("plan");
        assert!(plan.steps[1].summary.ends_with("..."));
    }
}
