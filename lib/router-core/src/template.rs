//! Rendering of router configuration templates against the routing table

use std::collections::BTreeMap;
use std::error::Error as _;
use std::fmt;

use tera::{Context, Tera};
use thiserror::Error;

use crate::routing_data::RoutingData;

/// A template that failed to parse or render
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateError {
    /// Name of the artifact (template key) that failed
    pub artifact: String,
    pub message: String,
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.artifact, self.message)
    }
}

/// Every template failure of one rendering run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("template rendering failed: {}", join_errors(.errors))]
pub struct TemplateErrors {
    pub errors: Vec<TemplateError>,
}

impl TemplateErrors {
    /// Names of the artifacts that failed
    pub fn artifacts(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.artifact.as_str()).collect()
    }
}

fn join_errors(errors: &[TemplateError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Render every template in `templates` with `data` as context.
///
/// Templates are independent: one bad template does not stop the others from
/// being attempted, and all failures are returned together. On success the
/// output has exactly the input's keys.
pub fn render_all(
    templates: &BTreeMap<String, String>,
    data: &RoutingData,
) -> Result<BTreeMap<String, String>, TemplateErrors> {
    let context = match Context::from_serialize(data) {
        Ok(context) => context,
        Err(e) => {
            let message = describe(&e);
            return Err(TemplateErrors {
                errors: templates
                    .keys()
                    .map(|name| TemplateError {
                        artifact: name.clone(),
                        message: message.clone(),
                    })
                    .collect(),
            });
        }
    };

    let mut rendered = BTreeMap::new();
    let mut errors = Vec::new();

    for (name, source) in templates {
        match render_one(name, source, &context) {
            Ok(text) => {
                rendered.insert(name.clone(), text);
            }
            Err(e) => errors.push(TemplateError {
                artifact: name.clone(),
                message: describe(&e),
            }),
        }
    }

    if errors.is_empty() {
        Ok(rendered)
    } else {
        Err(TemplateErrors { errors })
    }
}

fn render_one(name: &str, source: &str, context: &Context) -> tera::Result<String> {
    let mut tera = Tera::default();
    // Output is proxy configuration, never HTML.
    tera.autoescape_on(vec![]);
    tera.add_raw_template(name, source)?;
    tera.render(name, context)
}

/// Tera keeps the useful part of its messages in the source chain
fn describe(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing_data::RoutingRule;

    fn data() -> RoutingData {
        RoutingData {
            udp_port: 5060,
            tcp_port: 0,
            advertise_address: "192.0.2.10".to_string(),
            generation: 1,
            rules: vec![
                RoutingRule {
                    owner: "ns1/I1".to_string(),
                    domain: "example.com".to_string(),
                    headnumber: "100".to_string(),
                    backend: "svc1.ns1".to_string(),
                },
                RoutingRule {
                    owner: "ns1/I1".to_string(),
                    domain: "example.org".to_string(),
                    headnumber: "200".to_string(),
                    backend: "svc2.ns1".to_string(),
                },
            ],
        }
    }

    fn templates(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_renders_fields_by_name() {
        let input = templates(&[
            ("listen.cfg", "listen=udp:{{ advertiseAddress }}:{{ udpPort }}"),
            (
                "routes.cfg",
                "{% for rule in rules %}{{ rule.domain }}/{{ rule.headnumber }}->{{ rule.backend }}\n{% endfor %}",
            ),
        ]);

        let output = render_all(&input, &data()).unwrap();

        assert_eq!(output.len(), 2);
        assert_eq!(output["listen.cfg"], "listen=udp:192.0.2.10:5060");
        assert_eq!(
            output["routes.cfg"],
            "example.com/100->svc1.ns1\nexample.org/200->svc2.ns1\n"
        );
    }

    #[test]
    fn test_no_html_escaping() {
        let input = templates(&[("page.html", "{{ rules.0.owner }}")]);
        let output = render_all(&input, &data()).unwrap();
        assert_eq!(output["page.html"], "ns1/I1");
    }

    #[test]
    fn test_empty_template_set() {
        let output = render_all(&BTreeMap::new(), &data()).unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn test_collects_all_failures_with_artifact_names() {
        let input = templates(&[
            ("bad-parse.cfg", "{{ unclosed"),
            ("bad-render.cfg", "{{ no_such_field }}"),
            ("good.cfg", "{{ tcpPort }}"),
        ]);

        let err = render_all(&input, &data()).unwrap_err();

        assert_eq!(err.artifacts(), vec!["bad-parse.cfg", "bad-render.cfg"]);
        let message = err.to_string();
        assert!(message.contains("bad-parse.cfg"));
        assert!(message.contains("bad-render.cfg"));
        assert!(!message.contains("good.cfg"));
    }
}
