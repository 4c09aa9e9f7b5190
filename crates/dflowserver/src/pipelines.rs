use dflowcore::{StepError, Value};
use dflowruntime::{Engine, Flow, Pipeline};
use serde_json::json;
use std::collections::HashMap;

/// Order approval: created by `order.submitted`, parked until `order.approve`.
pub fn approval() -> Flow {
    Flow::from_call("order.submitted")
        .id("order.submitted")
        .map(|cp, payload| {
            let order: Value = serde_json::from_str(payload.as_str().unwrap_or("{}"))?;
            cp.put("order", &order)?;
            Ok(order)
        })
        .id("order.parse")
        .await_call("order.approve")
        .id("order.approve")
        .name("waiting for approval")
        .map(|cp, order| {
            let approver = cp
                .closure_data("callback")
                .and_then(|data| data.get("payload"))
                .cloned()
                .unwrap_or(Value::Null);
            Ok(json!({ "order": order, "approved_by": approver }))
        })
        .id("order.approved")
}

/// Pricing: two quotes computed in parallel, the cheaper one wins.
pub fn pricing() -> Flow {
    let base = Flow::just(json!({ "carrier": "base", "price": 42 })).id("quote");
    let express = Flow::just(json!({ "carrier": "express", "price": 57 }))
        .id("quote")
        .delay_for(200);

    Flow::zip(vec![base, express], |_, quotes| {
        quotes
            .into_iter()
            .min_by_key(|q| q.get("price").and_then(Value::as_i64).unwrap_or(i64::MAX))
            .ok_or_else(|| StepError::user("no quotes"))
    })
    .id("pricing.quotes")
    .name("collect quotes")
}

pub async fn install_all(engine: &Engine) -> anyhow::Result<HashMap<String, Pipeline>> {
    let mut pipelines = HashMap::new();
    for (name, flow) in [("approval", approval()), ("pricing", pricing())] {
        let pipeline = engine.install(&flow, name).await?;
        pipelines.insert(name.to_string(), pipeline);
    }
    Ok(pipelines)
}
