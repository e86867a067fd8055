//! Resolving a container's image reference on a particular worker.

use beacon_core::check::VersionedResourceType;
use beacon_core::container::ImageSpec;
use beacon_core::worker::Worker;
use beacon_core::{Error, Result};
use serde_json::Value;

/// The image reference for `spec` on `worker`.
///
/// Custom types run the image named by their source, pinned to the digest
/// in their current version. Base types run the image the worker
/// advertises for them.
pub fn resolve_image(
    spec: &ImageSpec,
    worker: &Worker,
    resource_types: &[VersionedResourceType],
) -> Result<String> {
    let name = match spec {
        ImageSpec::Url(url) => return Ok(url.clone()),
        ImageSpec::ResourceType(name) => name,
    };

    if let Some(custom) = resource_types.iter().find(|t| &t.name == name) {
        return custom_type_image(custom);
    }

    worker
        .base_resource_type(name)
        .map(|rt| rt.image.clone())
        .ok_or_else(|| {
            Error::Config(format!(
                "worker '{}' does not support resource type '{}'",
                worker.name, name
            ))
        })
}

fn custom_type_image(custom: &VersionedResourceType) -> Result<String> {
    let repository = match custom.source.get("repository") {
        Some(Value::String(repo)) if !repo.is_empty() => repo.as_str(),
        _ => {
            return Err(Error::Config(format!(
                "resource type '{}' has no image repository in its source",
                custom.name
            )));
        }
    };

    let mut image = repository.to_string();
    if let Some(Value::String(tag)) = custom.source.get("tag") {
        image.push(':');
        image.push_str(tag);
    }
    if let Some(digest) = custom.version.as_ref().and_then(|v| v.get("digest")) {
        image.push('@');
        image.push_str(digest);
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::worker;
    use beacon_core::check::{Source, Version};
    use serde_json::json;

    fn custom(source: Value, version: Option<Version>) -> VersionedResourceType {
        let Value::Object(source) = source else {
            panic!("source must be an object");
        };
        VersionedResourceType {
            name: "my-type".to_string(),
            type_: "registry-image".to_string(),
            source,
            tags: vec![],
            version,
        }
    }

    #[test]
    fn test_url_is_used_verbatim() {
        let image = resolve_image(
            &ImageSpec::Url("docker.io/library/alpine:3".to_string()),
            &worker("w"),
            &[],
        )
        .unwrap();
        assert_eq!(image, "docker.io/library/alpine:3");
    }

    #[test]
    fn test_base_type_uses_worker_image() {
        let image =
            resolve_image(&ImageSpec::ResourceType("git".to_string()), &worker("w"), &[]).unwrap();
        assert_eq!(image, worker("w").resource_types[0].image);
    }

    #[test]
    fn test_custom_type_is_pinned_to_digest() {
        let types = vec![custom(
            json!({"repository": "example/my-resource", "tag": "1.2"}),
            Some(Version::from([("digest".to_string(), "sha256:abc".to_string())])),
        )];
        let image = resolve_image(
            &ImageSpec::ResourceType("my-type".to_string()),
            &worker("w"),
            &types,
        )
        .unwrap();
        assert_eq!(image, "example/my-resource:1.2@sha256:abc");
    }

    #[test]
    fn test_custom_type_without_repository_is_rejected() {
        let types = vec![custom(Value::Object(Source::new()), None)];
        let err = resolve_image(
            &ImageSpec::ResourceType("my-type".to_string()),
            &worker("w"),
            &types,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unsupported_base_type_is_rejected() {
        let err = resolve_image(&ImageSpec::ResourceType("s3".to_string()), &worker("w"), &[])
            .unwrap_err();
        assert!(err.to_string().contains("'s3'"));
    }
}
