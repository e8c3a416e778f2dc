//! `multipart/form-data` uploads (screenshots).
//!
//! A [`MultipartForm`] keeps its parts as owned bytes. reqwest's form body is
//! a one-shot stream, so [`DeliveryClient::post_form`] asks for a fresh
//! [`reqwest::multipart::Form`] on every attempt.
//!
//! [`DeliveryClient::post_form`]: crate::DeliveryClient::post_form

use reqwest::multipart::{Form, Part};

use crate::error::DeliveryError;

#[derive(Debug, Clone)]
struct FilePart {
    field: String,
    file_name: String,
    content_type: String,
    data: Vec<u8>,
}

/// Reusable description of a multipart body with text fields and file parts.
#[derive(Debug, Clone, Default)]
pub struct MultipartForm {
    fields: Vec<(String, String)>,
    files: Vec<FilePart>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plain text field.
    pub fn text(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.push((name.to_string(), value.into()));
        self
    }

    /// Add a file part.
    pub fn file(mut self, field: &str, file_name: &str, content_type: &str, data: Vec<u8>) -> Self {
        self.files.push(FilePart {
            field: field.to_string(),
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            data,
        });
        self
    }

    /// Build a reqwest form for one request.
    pub fn to_form(&self) -> Result<Form, DeliveryError> {
        let mut form = Form::new();
        for (name, value) in &self.fields {
            form = form.text(name.clone(), value.clone());
        }
        for part in &self.files {
            let file = Part::bytes(part.data.clone())
                .file_name(part.file_name.clone())
                .mime_str(&part.content_type)
                .map_err(|e| DeliveryError::Form(format!("{}: {}", part.field, e)))?;
            form = form.part(part.field.clone(), file);
        }
        Ok(form)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_form_gets_its_own_boundary() {
        let form = MultipartForm::new()
            .text("computer_name", "WS-042")
            .file("screenshot", "shot.jpg", "image/jpeg", vec![0xFF, 0xD8, 0xFF]);
        let a = form.to_form().unwrap();
        let b = form.to_form().unwrap();
        assert_ne!(a.boundary(), b.boundary());
    }

    #[test]
    fn test_invalid_content_type_is_rejected() {
        let err = MultipartForm::new()
            .file("screenshot", "shot.jpg", "not a mime", vec![1])
            .to_form()
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Form(ref m) if m.starts_with("screenshot")));
        assert!(!err.is_retryable());
    }
}
