use super::*;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Last-update stamp for a new state of `prior`; never moves backwards.
pub(crate) fn next_update_time(prior: &Object) -> i64 {
    now_millis()
        .max(prior.last_update_time_unix)
        .max(prior.creation_time_unix)
}

pub(crate) fn effective_limit(config: &KindbConfig, requested: Option<usize>) -> usize {
    match requested {
        None | Some(0) => config.default_list_limit,
        Some(limit) => limit.min(config.max_list_limit),
    }
}

pub(crate) fn page_offset(limit: usize, page: Option<usize>) -> Result<usize, KindbError> {
    match page {
        None => Ok(0),
        Some(0) => Err(KindbError::BadRequest("page numbers start at 1".into())),
        Some(page) => (page - 1)
            .checked_mul(limit)
            .ok_or_else(|| KindbError::BadRequest(format!("page {page} is out of range"))),
    }
}

pub(crate) fn ensure_same_class(prior: &Object, requested: &str) -> Result<(), KindbError> {
    if prior.class != requested {
        return Err(KindbError::Validation(format!(
            "class cannot change from '{}' to '{requested}'",
            prior.class
        )));
    }
    Ok(())
}

/// Applies `operations` to the JSON form of `prior`. Identity, creation time
/// and owner key survive any patch; the class may not change.
pub(crate) fn apply_patch(
    prior: &Object,
    operations: &json_patch::Patch,
) -> Result<Object, KindbError> {
    let mut document =
        serde_json::to_value(prior).map_err(|e| KindbError::Encode(e.to_string()))?;
    json_patch::patch(&mut document, &operations.0)
        .map_err(|e| KindbError::Validation(format!("patch cannot be applied: {e}")))?;
    let mut patched: Object = serde_json::from_value(document)
        .map_err(|e| KindbError::Validation(format!("patched object is invalid: {e}")))?;
    ensure_same_class(prior, &patched.class)?;
    patched.creation_time_unix = prior.creation_time_unix;
    patched.key = prior.key.clone();
    patched.last_update_time_unix = next_update_time(prior);
    Ok(patched)
}

/// Current entries of a `many` reference property; absent means empty.
pub(crate) fn stored_reference_list(
    schema: &Payload,
    property: &str,
) -> Result<Vec<Reference>, KindbError> {
    match schema.get(property) {
        None => Ok(Vec::new()),
        Some(PropertyValue::RefList(list)) => Ok(list.clone()),
        Some(other) => Err(KindbError::Validation(format!(
            "stored value of '{property}' is a {}, not a reference list",
            other.shape_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::Scalar;
    use serde_json::json;

    fn stored() -> Object {
        Object {
            class: "City".into(),
            context: "ctx".into(),
            schema: Payload::new().with("name", PropertyValue::Primitive(Scalar::Text("A".into()))),
            creation_time_unix: 100,
            last_update_time_unix: 200,
            key: Some(Reference::local(Uuid::new_v4(), RefType::Key)),
        }
    }

    #[test]
    fn paging_uses_one_based_pages() {
        let config = KindbConfig::default();
        assert_eq!(effective_limit(&config, None), 20);
        assert_eq!(effective_limit(&config, Some(0)), 20);
        assert_eq!(effective_limit(&config, Some(5_000)), 1_000);
        assert_eq!(page_offset(10, None).expect("offset"), 0);
        assert_eq!(page_offset(10, Some(1)).expect("offset"), 0);
        assert_eq!(page_offset(10, Some(3)).expect("offset"), 20);
        assert!(page_offset(10, Some(0)).is_err());
    }

    #[test]
    fn patch_keeps_identity_fields() {
        let prior = stored();
        let patch: json_patch::Patch = serde_json::from_value(json!([
            {"op": "replace", "path": "/schema/name", "value": "B"},
            {"op": "replace", "path": "/creationTimeUnix", "value": 1},
            {"op": "remove", "path": "/key"}
        ]))
        .expect("patch");
        let patched = apply_patch(&prior, &patch).expect("apply");
        assert_eq!(
            patched.schema.get("name"),
            Some(&PropertyValue::Primitive(Scalar::Text("B".into())))
        );
        assert_eq!(patched.creation_time_unix, 100);
        assert_eq!(patched.key, prior.key);
        assert!(patched.last_update_time_unix >= 200);
    }

    #[test]
    fn patch_rejects_class_change_and_bad_paths() {
        let prior = stored();
        let class_change: json_patch::Patch =
            serde_json::from_value(json!([{"op": "replace", "path": "/@class", "value": "Town"}]))
                .expect("patch");
        let err = apply_patch(&prior, &class_change).expect_err("class change");
        assert_eq!(err.status(), MutationStatus::UnprocessableEntity);

        let missing: json_patch::Patch =
            serde_json::from_value(json!([{"op": "remove", "path": "/schema/mayor"}]))
                .expect("patch");
        let err = apply_patch(&prior, &missing).expect_err("missing path");
        assert_eq!(err.status(), MutationStatus::UnprocessableEntity);

        let nulled: json_patch::Patch = serde_json::from_value(json!([
            {"op": "replace", "path": "/schema/name", "value": null}
        ]))
        .expect("patch");
        assert!(apply_patch(&prior, &nulled).is_err());
    }

    #[test]
    fn stored_reference_list_treats_absent_as_empty() {
        let prior = stored();
        assert!(stored_reference_list(&prior.schema, "sisters").expect("empty").is_empty());
        assert!(stored_reference_list(&prior.schema, "name").is_err());
    }
}
