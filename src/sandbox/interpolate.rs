//! `${VAR-default}` substitution for backend config templates.
//!
//! Only brace references are substituted; nothing is evaluated. Sample
//! metadata is exposed as `SAMPLE_METADATA_<KEY>` and every such reference
//! must carry a default so the template stays valid outside a sample
//! (for example while images are built during `config_init`).

use std::collections::HashMap;

use super::{SampleMetadata, SandboxError, SandboxResult};

const METADATA_PREFIX: &str = "SAMPLE_METADATA_";

/// Variable name under which a metadata key is visible to templates.
pub(crate) fn metadata_variable(key: &str) -> String {
    let key: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{METADATA_PREFIX}{key}")
}

/// Substitutes variable references in `template`.
pub(crate) fn interpolate(template: &str, metadata: &SampleMetadata) -> SandboxResult<String> {
    let vars: HashMap<String, &str> = metadata
        .iter()
        .map(|(k, v)| (metadata_variable(k), v.as_str()))
        .collect();

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body.find('}').ok_or_else(|| {
                SandboxError::configuration(format!("unterminated variable reference in '{rest}'"))
            })?;
            out.push_str(&substitute(&body[..end], &vars)?);
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = after;
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn substitute(expr: &str, vars: &HashMap<String, &str>) -> SandboxResult<String> {
    let (name, default, empty_is_unset) = if let Some((name, default)) = expr.split_once(":-") {
        (name, Some(default), true)
    } else if let Some((name, default)) = expr.split_once('-') {
        (name, Some(default), false)
    } else {
        (expr, None, false)
    };

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SandboxError::configuration(format!(
            "invalid variable reference '${{{expr}}}'"
        )));
    }

    let value = if name.starts_with(METADATA_PREFIX) {
        if default.is_none() {
            return Err(SandboxError::configuration(format!(
                "'${{{name}}}' needs a default, e.g. '${{{name}-value}}'"
            )));
        }
        vars.get(name).map(|v| (*v).to_string())
    } else {
        std::env::var(name).ok()
    };

    Ok(match (value, default) {
        (Some(v), Some(d)) if empty_is_unset && v.is_empty() => d.to_string(),
        (Some(v), _) => v,
        (None, Some(d)) => d.to_string(),
        (None, None) => String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(pairs: &[(&str, &str)]) -> SampleMetadata {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_metadata_variable_name() {
        assert_eq!(metadata_variable("image"), "SAMPLE_METADATA_IMAGE");
        assert_eq!(metadata_variable("web-port"), "SAMPLE_METADATA_WEB_PORT");
    }

    #[test]
    fn test_metadata_substituted() {
        let out = interpolate(
            "image: ${SAMPLE_METADATA_IMAGE-alpine}",
            &metadata(&[("image", "debian")]),
        )
        .unwrap();
        assert_eq!(out, "image: debian");
    }

    #[test]
    fn test_default_used_outside_sample() {
        let out = interpolate("image: ${SAMPLE_METADATA_IMAGE-alpine}", &metadata(&[])).unwrap();
        assert_eq!(out, "image: alpine");
    }

    #[test]
    fn test_colon_dash_treats_empty_as_unset() {
        let md = metadata(&[("tag", "")]);
        assert_eq!(
            interpolate("${SAMPLE_METADATA_TAG:-latest}", &md).unwrap(),
            "latest"
        );
        assert_eq!(interpolate("${SAMPLE_METADATA_TAG-latest}", &md).unwrap(), "");
    }

    #[test]
    fn test_metadata_without_default_rejected() {
        let err = interpolate("${SAMPLE_METADATA_IMAGE}", &metadata(&[("image", "x")])).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_dollar_escape_and_bare_dollar() {
        assert_eq!(
            interpolate("cost $$5 and $HOME", &metadata(&[])).unwrap(),
            "cost $5 and $HOME"
        );
    }

    #[test]
    fn test_unterminated_reference() {
        assert!(interpolate("${SAMPLE_METADATA_X-a", &metadata(&[])).is_err());
    }

    #[test]
    fn test_invalid_name_rejected() {
        assert!(interpolate("${$(rm -rf /)}", &metadata(&[])).is_err());
    }

    #[test]
    fn test_unset_environment_variable_is_empty() {
        assert_eq!(
            interpolate("[${SANDKIT_TEST_SURELY_UNSET_VAR}]", &metadata(&[])).unwrap(),
            "[]"
        );
    }
}
