//! Unit tests for ClusterSpec validation
//!
//! Tests the `ClusterSpec::validate()` function to ensure it correctly
//! accepts valid configurations and rejects invalid ones.

#[cfg(test)]
mod cluster_spec_validation {
    use crate::model::{ClusterSpec, EndpointAccess, SpecValidationError, SubnetSelection};

    /// Helper to create a minimal valid ClusterSpec
    fn valid_spec() -> ClusterSpec {
        ClusterSpec::new("demo-cluster", "vpc-0123456789abcdef0", "1.28")
    }

    fn fields(errors: &[SpecValidationError]) -> Vec<&str> {
        errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn test_valid_spec_passes() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn test_valid_spec_with_explicit_subnets_passes() {
        let spec = valid_spec().with_subnets(SubnetSelection::Explicit(vec![
            "subnet-a".to_string(),
            "subnet-b".to_string(),
        ]));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_name() {
        let mut spec = valid_spec();
        spec.name = "1-starts-with-digit".to_string();
        let errors = spec.validate().unwrap_err();
        assert_eq!(fields(&errors), vec!["spec.name"]);

        spec.name = "has spaces".to_string();
        assert!(spec.validate().is_err());

        spec.name = "a".repeat(101);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_vpc() {
        let spec = ClusterSpec::new("demo", " ", "1.28");
        let errors = spec.validate().unwrap_err();
        assert_eq!(fields(&errors), vec!["spec.network.vpcId"]);
    }

    #[test]
    fn test_rejects_malformed_version() {
        let spec = ClusterSpec::new("demo", "vpc-1", "latest");
        let errors = spec.validate().unwrap_err();
        assert_eq!(fields(&errors), vec!["spec.version"]);
        assert!(errors[0].message.contains("latest"));
    }

    #[test]
    fn test_rejects_closed_endpoint() {
        let spec = valid_spec().with_endpoint_access(EndpointAccess {
            public: false,
            private: false,
        });
        let errors = spec.validate().unwrap_err();
        assert_eq!(fields(&errors), vec!["spec.endpointAccess"]);
    }

    #[test]
    fn test_rejects_empty_explicit_subnets() {
        let spec = valid_spec().with_subnets(SubnetSelection::Explicit(vec![]));
        let errors = spec.validate().unwrap_err();
        assert_eq!(fields(&errors), vec!["spec.subnets.ids"]);
    }

    #[test]
    fn test_rejects_non_arn_service_role() {
        let spec = valid_spec().with_service_role("my-role");
        let errors = spec.validate().unwrap_err();
        assert_eq!(fields(&errors), vec!["spec.serviceRoleArn"]);
    }

    #[test]
    fn test_collects_multiple_errors() {
        let spec = ClusterSpec::new("", "", "x").with_endpoint_access(EndpointAccess {
            public: false,
            private: false,
        });
        let errors = spec.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().all(|e| !e.how_to_fix.is_empty()));
    }

    #[test]
    fn test_spec_deserializes_from_camel_case() {
        let spec: ClusterSpec = serde_json::from_value(serde_json::json!({
            "name": "demo",
            "network": { "vpcId": "vpc-1" },
            "subnets": { "type": "explicit", "ids": ["subnet-a"] },
            "version": "1.28",
            "accessMode": "API"
        }))
        .unwrap();
        assert_eq!(
            spec.subnets,
            SubnetSelection::Explicit(vec!["subnet-a".to_string()])
        );
        assert_eq!(spec.access_mode, crate::model::AccessMode::Api);
        assert!(spec.endpoint_access.public && spec.endpoint_access.private);
    }
}
