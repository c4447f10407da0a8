//! Workflow definitions bundled with the CLI.

use navis_core::{
    ALL_STATES, Role, SourceStates, Stage, StepBuilder, WorkflowBuilder, WorkflowError,
    WorkflowRegistry,
};
use serde_json::{json, Value};

/// Minimum credit score accepted by the `credit-check` step.
pub const MIN_CREDIT_SCORE: i64 = 600;

/// Loan application: collect documents, check credit, collect signatures.
pub fn loan_application() -> WorkflowBuilder {
    WorkflowBuilder::new("Loan Application")
        .desc("Consumer loan intake, credit review and signing")
        .stage(Stage::new("intake", "Intake").stage_type("collection"))
        .stage(Stage::new("review", "Credit Review"))
        .stage(Stage::new("signing", "Signing"))
        .role(Role::new("applicant", "Applicant"))
        .role(Role::new("officer", "Loan Officer"))
        .step(
            StepBuilder::new("collect-documents", "Collect Documents", "intake")
                .states(["COLLECTING", "SUBMITTED"])
                .initial()
                .finish_on(["SUBMITTED"])
                .transition("SUBMITTED", SourceStates::only(["COLLECTING"]), |ctx, args| {
                    let count = args.get("count").cloned().unwrap_or(Value::Null);
                    ctx.set_step_memory("documents", count)?;
                    Ok(vec!["Documents submitted".to_string()])
                }),
        )
        .step(
            StepBuilder::new("credit-check", "Credit Check", "review")
                .states(["PENDING", "PASSED", "REJECTED"])
                .finish_on(["PASSED", "REJECTED"])
                .allow("PASSED", SourceStates::only(["PENDING"]))
                .allow("REJECTED", SourceStates::only(["PENDING"])),
        )
        .step(
            StepBuilder::new("signature", "Signature", "signing")
                .multi()
                .states(["PENDING", "SIGNED"])
                .finish_on(["SIGNED"])
                .allow("SIGNED", ALL_STATES)
                .on_event("document-signed", |ctx, data| {
                    ctx.transit_step("SIGNED", data)?;
                    let signer = ctx.step().map(|s| s.selector.clone()).unwrap_or_default();
                    Ok(vec![format!("Signed by {}", signer)])
                }),
        )
        .on_start(|ctx, _| {
            ctx.set_label("INTAKE")?;
            Ok(vec!["Application opened".to_string()])
        })
        .on_event("documents-uploaded", |ctx, data| {
            let collect = ctx.steps("collect-documents").first().map(|s| s.id);
            let Some(collect) = collect else {
                return Err(WorkflowError::NotFound("Step [collect-documents]".into()));
            };
            ctx.transit(collect, "SUBMITTED", data)?;
            ctx.add_step("credit-check", None)?;
            ctx.set_label("REVIEW")?;
            Ok(vec!["Credit check requested".to_string()])
        })
        .on_event("credit-scored", |ctx, data| {
            let score = data.get("score").and_then(Value::as_i64).unwrap_or(0);
            let check = ctx.steps("credit-check").first().map(|s| s.id);
            let Some(check) = check else {
                return Err(WorkflowError::Execution(
                    "Credit score received before documents".into(),
                ));
            };
            ctx.set_memory("credit_score", json!(score))?;
            if score < MIN_CREDIT_SCORE {
                ctx.transit(check, "REJECTED", data)?;
                ctx.set_label("DECLINED")?;
                return Ok(vec![format!("Credit score {} below {}", score, MIN_CREDIT_SCORE)]);
            }
            ctx.transit(check, "PASSED", data)?;
            let signers: Vec<String> = data
                .get("signers")
                .and_then(Value::as_array)
                .map(|list| list.iter().filter_map(Value::as_str).map(String::from).collect())
                .unwrap_or_default();
            for signer in &signers {
                ctx.add_step("signature", Some(signer.clone()))?;
            }
            ctx.set_label("SIGNING")?;
            Ok(vec![format!("Awaiting {} signature(s)", signers.len())])
        })
        .on_finish(|ctx, _| Ok(vec![format!("{} closed", ctx.workflow().title)]))
}

pub fn register_demos(registry: &mut WorkflowRegistry) -> Result<(), WorkflowError> {
    registry.register(loan_application())?;
    Ok(())
}
