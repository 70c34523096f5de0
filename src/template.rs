use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext,
    RenderErrorReason,
};
use serde_json::Value;

use crate::error::OrchestrateError;

/// Template renderer collaborator consumed by output-transformation actions.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, context: &Value) -> Result<String, OrchestrateError>;
}

/// Handlebars-backed renderer with a `json` helper that interpolates any
/// context value as serialized JSON.
pub struct HandlebarsRenderer {
    hb: Handlebars<'static>,
}

impl HandlebarsRenderer {
    pub fn new() -> Self {
        let mut hb = Handlebars::new();
        hb.register_helper(
            "json",
            Box::new(
                move |h: &Helper<'_>,
                      _: &Handlebars<'_>,
                      _: &Context,
                      _: &mut RenderContext<'_, '_>,
                      out: &mut dyn Output|
                      -> HelperResult {
                    let param = h.param(0).ok_or_else(|| {
                        RenderErrorReason::MissingVariable(Some(
                            "helper `json` got no argument".to_string(),
                        ))
                    })?;
                    let s = serde_json::to_string(param.value())
                        .map_err(RenderErrorReason::SerdeError)?;
                    out.write(&s)?;
                    Ok(())
                },
            ) as Box<dyn HelperDef + Send + Sync>,
        );
        Self { hb }
    }
}

impl Default for HandlebarsRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer for HandlebarsRenderer {
    fn render(&self, template: &str, context: &Value) -> Result<String, OrchestrateError> {
        self.hb.render_template(template, context).map_err(|e| {
            OrchestrateError::validation(
                format!("template render failed: {}", e),
                Value::String(template.to_string()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_renders_plain_fields() {
        let renderer = HandlebarsRenderer::new();
        let out = renderer
            .render("Hello {{name}}!", &json!({"name": "Ada"}))
            .unwrap();
        assert_eq!(out, "Hello Ada!");
    }

    #[test]
    fn test_json_helper_serializes_values() {
        let renderer = HandlebarsRenderer::new();
        let out = renderer
            .render("{{json user}}", &json!({"user": {"_id": "u1"}}))
            .unwrap();
        assert_eq!(out, r#"{"_id":"u1"}"#);
    }

    #[test]
    fn test_broken_template_is_an_error() {
        let renderer = HandlebarsRenderer::new();
        let err = renderer.render("{{#if}}", &json!({})).unwrap_err();
        assert_eq!(err.status_code, 400);
    }
}
