//! Pure planner: turns a run's query text and decided meta (intent, plan
//! hints, memory item, interpretation) into an ordered list of plan steps.

use serde_json::{json, Value};

use aura_types::{new_id, PlanStep, Run, StepStatus};

use crate::phrases;
use crate::reminders::parse_reminder_text;

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("planner_memory_item_missing")]
    MemoryItemMissing,
}

struct DraftStep {
    title: &'static str,
    skill_name: &'static str,
    inputs: Value,
    kind: String,
}

fn draft(title: &'static str, skill_name: &'static str, inputs: Value, kind: &str) -> DraftStep {
    DraftStep {
        title,
        skill_name,
        inputs,
        kind: kind.to_string(),
    }
}

fn autopilot_step(query_text: &str, kind: &str) -> DraftStep {
    draft(
        "Автопилот: управление компьютером",
        "computer_autopilot",
        json!({"goal": query_text}),
        kind,
    )
}

/// Memory payload for the auto-appended commit step, shaped like the
/// interpreter's validated output.
fn memory_payload_from_interpretation(query_text: &str, interpretation: &Value) -> Option<Value> {
    if interpretation.get("should_store") != Some(&Value::Bool(true)) {
        return None;
    }
    let summary = interpretation
        .get("summary")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())?;
    let title = interpretation
        .get("title")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("Профиль пользователя");
    Some(json!({
        "content": query_text.trim(),
        "origin": "auto",
        "memory_payload": {
            "title": title,
            "summary": summary,
            "confidence": interpretation.get("confidence"),
            "facts": interpretation.get("facts").cloned().unwrap_or_else(|| json!([])),
            "preferences": interpretation.get("preferences").cloned().unwrap_or_else(|| json!([])),
            "possible_facts": interpretation.get("possible_facts").cloned().unwrap_or_else(|| json!([])),
        },
    }))
}

fn step_for_hint(hint: &str, run: &Run) -> Result<Option<DraftStep>, PlannerError> {
    let query_text = run.query_text.as_str();
    let step = match hint {
        "CHAT_RESPONSE" => Some(draft(
            "Ответ в чате",
            "chat_response",
            json!({"query": query_text}),
            "CHAT_RESPONSE",
        )),
        "CLARIFY_QUESTION" => {
            let questions = run
                .meta
                .get("intent_questions")
                .cloned()
                .unwrap_or_else(|| json!([phrases::ASK_CLARIFY_ACTION]));
            Some(draft(
                "Уточняющий вопрос",
                "clarify_question",
                json!({"questions": questions}),
                "CLARIFY_QUESTION",
            ))
        }
        "WEB_RESEARCH" => Some(draft(
            "Веб-исследование",
            "web_research",
            json!({"query": query_text, "mode": "deep"}),
            "WEB_RESEARCH",
        )),
        "DOCUMENT_WRITE" => Some(draft(
            "Сформировать отчёт",
            "report",
            json!({}),
            "DOCUMENT_WRITE",
        )),
        "MEMORY_COMMIT" => {
            // Never guess at what to remember: a commit hint without the
            // classifier's memory item is a planning error.
            let memory_item = run
                .meta
                .get("memory_item")
                .filter(|v| v.is_object())
                .ok_or(PlannerError::MemoryItemMissing)?;
            let fact = memory_item
                .get("text")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or(PlannerError::MemoryItemMissing)?;
            Some(draft(
                "Сохранить в памяти",
                "memory_save",
                json!({
                    "content": query_text,
                    "facts": [fact],
                    "origin": "user_command",
                }),
                "MEMORY_COMMIT",
            ))
        }
        "REMINDER_CREATE" => {
            let parsed = parse_reminder_text(query_text, None);
            match (parsed.due_at, parsed.text) {
                (Some(due_at), Some(text)) => Some(draft(
                    "Создать напоминание",
                    "reminder_create",
                    json!({"due_at": due_at, "text": text}),
                    "REMINDER_CREATE",
                )),
                // Unparseable time: the step is simply not emitted.
                _ => None,
            }
        }
        "BROWSER_RESEARCH_UI" | "COMPUTER_ACTIONS" | "FILE_ORGANIZE" | "CODE_ASSIST"
        | "SMOKE_RUN" => Some(autopilot_step(query_text, hint)),
        _ => None,
    };
    Ok(step)
}

fn finalize(run: &Run, drafts: Vec<DraftStep>) -> Vec<PlanStep> {
    let danger_flags: Vec<String> = run
        .meta
        .get("danger_flags")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    drafts
        .into_iter()
        .enumerate()
        .map(|(index, step)| PlanStep {
            id: new_id(),
            run_id: run.id.clone(),
            step_index: index as i64,
            title: step.title.to_string(),
            skill_name: step.skill_name.to_string(),
            inputs: step.inputs,
            depends_on: if index == 0 { vec![] } else { vec![index as i64 - 1] },
            status: StepStatus::Created,
            kind: step.kind,
            success_checks: vec![],
            danger_flags: danger_flags.clone(),
            requires_approval: false,
        })
        .collect()
}

pub fn create_plan_for_run(run: &Run) -> Result<Vec<PlanStep>, PlannerError> {
    let intent = run.meta_str("intent").unwrap_or("ACT");

    if intent == "CHAT" {
        return Ok(finalize(
            run,
            vec![draft(
                "Ответ в чате",
                "chat_response",
                json!({"query": run.query_text.clone()}),
                "CHAT_RESPONSE",
            )],
        ));
    }

    let hints: Vec<String> = run
        .meta
        .get("plan_hint")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let mut drafts: Vec<DraftStep> = Vec::new();
    for hint in &hints {
        if let Some(step) = step_for_hint(hint, run)? {
            drafts.push(step);
        }
    }

    if drafts.is_empty() {
        drafts.push(autopilot_step(&run.query_text, "COMPUTER_ACTIONS"));
    }

    if run.meta_bool("needs_clarification") {
        let clarify = step_for_hint("CLARIFY_QUESTION", run)?.expect("clarify step");
        drafts.insert(0, clarify);
    }

    // Interpretation-driven memory commit is always appended last so the
    // explicit hint order stays stable.
    let has_memory_commit = drafts.iter().any(|d| d.kind == "MEMORY_COMMIT");
    if !has_memory_commit {
        if let Some(interpretation) = run.meta.get("memory_interpretation") {
            if let Some(inputs) = memory_payload_from_interpretation(&run.query_text, interpretation)
            {
                drafts.push(draft(
                    "Сохранить в памяти",
                    "memory_save",
                    inputs,
                    "MEMORY_COMMIT",
                ));
            }
        }
    }

    Ok(finalize(run, drafts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura_types::RunStatus;

    fn run_with(query: &str, intent: &str, extra: Value) -> Run {
        let mut meta = json!({"intent": intent});
        if let (Some(meta_map), Some(extra_map)) = (meta.as_object_mut(), extra.as_object()) {
            for (key, value) in extra_map {
                meta_map.insert(key.clone(), value.clone());
            }
        }
        Run {
            id: "run-1".to_string(),
            project_id: "p-1".to_string(),
            query_text: query.to_string(),
            mode: "execute_confirm".to_string(),
            status: RunStatus::Created,
            parent_run_id: None,
            purpose: None,
            meta,
            created_at: aura_types::now_iso(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn chat_intent_yields_single_chat_step() {
        let plan = create_plan_for_run(&run_with("мне грустно", "CHAT", json!({}))).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].kind, "CHAT_RESPONSE");
    }

    #[test]
    fn default_act_without_hints_is_autopilot() {
        let plan = create_plan_for_run(&run_with("Сделай задачу", "ACT", json!({}))).unwrap();
        assert!(!plan.is_empty());
        assert_eq!(plan[0].kind, "COMPUTER_ACTIONS");
        assert_eq!(plan[0].skill_name, "computer_autopilot");
    }

    #[test]
    fn memory_commit_hint_uses_memory_item() {
        let run = run_with(
            "кстати меня Михаил зовут",
            "ACT",
            json!({
                "plan_hint": ["MEMORY_COMMIT"],
                "memory_item": {
                    "kind": "user_profile",
                    "text": "Имя пользователя: Михаил.",
                    "evidence": "меня Михаил зовут",
                },
            }),
        );
        let plan = create_plan_for_run(&run).unwrap();
        assert_eq!(plan[0].kind, "MEMORY_COMMIT");
        assert_eq!(plan[0].inputs["facts"], json!(["Имя пользователя: Михаил."]));
    }

    #[test]
    fn memory_commit_without_item_is_hard_error() {
        let run = run_with("запомни это", "ACT", json!({"plan_hint": ["MEMORY_COMMIT"]}));
        let err = create_plan_for_run(&run).unwrap_err();
        assert_eq!(err.to_string(), "planner_memory_item_missing");
    }

    #[test]
    fn interpretation_appends_memory_commit_last() {
        let run = run_with(
            "меня зовут Михаил, отвечай коротко",
            "ACT",
            json!({
                "plan_hint": ["COMPUTER_ACTIONS"],
                "memory_interpretation": {
                    "should_store": true,
                    "confidence": 0.91,
                    "title": "Профиль пользователя",
                    "summary": "Пользователь представился как Михаил и попросил короткие ответы.",
                    "facts": [
                        {"key": "user.name", "value": "Михаил", "confidence": 0.95, "evidence": "меня зовут Михаил"}
                    ],
                    "preferences": [
                        {"key": "style.brevity", "value": "short", "confidence": 0.82, "evidence": "отвечай коротко"}
                    ],
                },
            }),
        );
        let plan = create_plan_for_run(&run).unwrap();
        let kinds: Vec<&str> = plan.iter().map(|s| s.kind.as_str()).collect();
        assert_eq!(kinds, vec!["COMPUTER_ACTIONS", "MEMORY_COMMIT"]);
        let payload = &plan[1].inputs["memory_payload"];
        assert_eq!(
            payload["summary"],
            json!("Пользователь представился как Михаил и попросил короткие ответы.")
        );
        assert_eq!(payload["facts"][0]["key"], json!("user.name"));
    }

    #[test]
    fn reminder_hint_parses_time_or_is_skipped() {
        let run = run_with(
            "через 1 час напомни выпить воды",
            "ACT",
            json!({"plan_hint": ["REMINDER_CREATE"]}),
        );
        let plan = create_plan_for_run(&run).unwrap();
        assert_eq!(plan[0].kind, "REMINDER_CREATE");
        assert!(plan[0].inputs.get("due_at").is_some());

        // No parseable time: the hint yields no step and the plan falls
        // back to autopilot.
        let run = run_with(
            "напомни мне про это когда-нибудь потом без времени",
            "ACT",
            json!({"plan_hint": ["REMINDER_CREATE"]}),
        );
        let plan = create_plan_for_run(&run).unwrap();
        assert!(plan.iter().all(|s| s.kind != "REMINDER_CREATE"));
    }

    #[test]
    fn web_research_defaults_to_deep() {
        let run = run_with(
            "Найди источники по экономике",
            "ACT",
            json!({"plan_hint": ["WEB_RESEARCH"]}),
        );
        let plan = create_plan_for_run(&run).unwrap();
        assert_eq!(plan[0].skill_name, "web_research");
        assert_eq!(plan[0].inputs["mode"], json!("deep"));
    }

    #[test]
    fn clarification_step_is_prepended() {
        let run = run_with(
            "сделай это",
            "ACT",
            json!({
                "plan_hint": ["COMPUTER_ACTIONS"],
                "needs_clarification": true,
                "intent_questions": ["Что именно нужно сделать?"],
            }),
        );
        let plan = create_plan_for_run(&run).unwrap();
        assert_eq!(plan[0].kind, "CLARIFY_QUESTION");
        assert_eq!(plan[0].inputs["questions"], json!(["Что именно нужно сделать?"]));
        assert_eq!(plan[1].kind, "COMPUTER_ACTIONS");
        // Indices stay dense and chained after the insert.
        assert_eq!(plan[0].step_index, 0);
        assert_eq!(plan[1].step_index, 1);
        assert_eq!(plan[1].depends_on, vec![0]);
    }

    #[test]
    fn hints_produce_steps_in_hint_order() {
        let run = run_with(
            "через 1 час напомни и запомни что я Михаил",
            "ACT",
            json!({
                "plan_hint": ["REMINDER_CREATE", "MEMORY_COMMIT"],
                "memory_item": {
                    "kind": "user_profile",
                    "text": "Имя пользователя: Михаил.",
                    "evidence": "я Михаил",
                },
            }),
        );
        let plan = create_plan_for_run(&run).unwrap();
        let kinds: Vec<&str> = plan.iter().map(|s| s.kind.as_str()).collect();
        assert_eq!(kinds, vec!["REMINDER_CREATE", "MEMORY_COMMIT"]);
    }
}
