//! Container image references and registry checks
//! 容器镜像引用与仓库检查

use async_trait::async_trait;
use regex::{Captures, Regex};
use reqwest::{StatusCode, Url};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

/// Image resolution error / 镜像解析错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ImageResolutionError {
    #[error("invalid image reference '{0}'")]
    InvalidReference(String),

    #[error("image {0} not found in registry")]
    NotFound(String),

    #[error("registry refused access to {image}: status {status}")]
    Denied { image: String, status: u16 },

    #[error("registry lookup for {image} failed: {message}")]
    Unreachable { image: String, message: String },

    #[error("registry lookup for {0} timed out")]
    Timeout(String),
}

/// Parsed `[registry/]repository[:tag][@digest]` reference
/// 解析后的镜像引用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(image: &str) -> Result<Self, ImageResolutionError> {
        let image = image.trim();
        if image.is_empty() || image.chars().any(char::is_whitespace) {
            return Err(ImageResolutionError::InvalidReference(image.to_string()));
        }
        let (rest, digest) = match image.split_once('@') {
            Some((r, d)) => (r, Some(d.to_string())),
            None => (image, None),
        };
        let (registry, path) = match rest.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), remainder)
            }
            _ => (None, rest),
        };
        // A colon after the last slash separates the tag / 最后一个斜杠之后的冒号分隔标签
        let last_segment_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match path[last_segment_start..].rfind(':') {
            Some(i) => {
                let split = last_segment_start + i;
                (path[..split].to_string(), Some(path[split + 1..].to_string()))
            }
            None => (path.to_string(), None),
        };
        if repository.is_empty() || tag.as_deref() == Some("") {
            return Err(ImageResolutionError::InvalidReference(image.to_string()));
        }
        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Whether a digest or a tag other than `latest` pins the image
    /// 是否由摘要或非`latest`标签固定
    pub fn is_pinned(&self) -> bool {
        self.digest.is_some() || self.tag.as_deref().is_some_and(|t| t != "latest")
    }

    /// Manifest reference for the registry API / 仓库API的清单引用
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or("latest")
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{}/", registry)?;
        }
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

fn wdl_docker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(docker\s*:\s*)"([^"]*)""#).expect("static regex")
    })
}

/// Tag every untagged `docker: "..."` image in a WDL source with `commit`.
/// Returns the rewritten source and the (tagged) images it references.
/// 为WDL源码中未加标签的镜像追加提交哈希，返回改写后的源码与引用的镜像
pub fn tag_wdl_images(
    source: &str,
    commit: &str,
) -> Result<(String, Vec<String>), ImageResolutionError> {
    let mut images = Vec::new();
    let mut failure = None;
    let rewritten = wdl_docker_pattern().replace_all(source, |caps: &Captures| {
        let raw = &caps[2];
        match ImageReference::parse(raw) {
            Ok(mut reference) => {
                if !reference.is_pinned() {
                    reference.tag = Some(commit.to_string());
                }
                let tagged = reference.to_string();
                images.push(tagged.clone());
                format!("{}\"{}\"", &caps[1], tagged)
            }
            Err(e) => {
                failure.get_or_insert(e);
                caps[0].to_string()
            }
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }
    images.dedup();
    Ok((rewritten.into_owned(), images))
}

/// Checks that an image can be pulled / 检查镜像是否可拉取
#[async_trait]
pub trait ImageResolver: Send + Sync + fmt::Debug {
    async fn resolve(&self, image: &str) -> Result<(), ImageResolutionError>;
}

/// Resolver that accepts every well-formed reference without a lookup
/// 不查询、接受所有格式正确引用的解析器
#[derive(Debug, Default, Clone, Copy)]
pub struct UnverifiedImageResolver;

#[async_trait]
impl ImageResolver for UnverifiedImageResolver {
    async fn resolve(&self, image: &str) -> Result<(), ImageResolutionError> {
        ImageReference::parse(image).map(|_| ())
    }
}

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json";

/// Docker Registry HTTP API v2 resolver / Docker Registry v2 API解析器
#[derive(Debug, Clone)]
pub struct RegistryImageResolver {
    client: reqwest::Client,
    default_registry: Url,
}

impl RegistryImageResolver {
    /// `default_registry` serves images without an explicit registry host
    /// `default_registry`用于未显式指定仓库主机的镜像
    pub fn new(default_registry: &str, timeout: Duration) -> Result<Self, ImageResolutionError> {
        let default_registry = Url::parse(default_registry).map_err(|e| {
            ImageResolutionError::InvalidReference(format!("{}: {}", default_registry, e))
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ImageResolutionError::Unreachable {
                image: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            default_registry,
        })
    }

    fn manifest_url(&self, reference: &ImageReference) -> Result<Url, ImageResolutionError> {
        let base = match &reference.registry {
            Some(host) => Url::parse(&format!("https://{}/", host)),
            None => Ok(self.default_registry.clone()),
        }
        .map_err(|e| ImageResolutionError::InvalidReference(e.to_string()))?;
        base.join(&format!(
            "v2/{}/manifests/{}",
            reference.repository,
            reference.reference()
        ))
        .map_err(|e| ImageResolutionError::InvalidReference(e.to_string()))
    }
}

#[async_trait]
impl ImageResolver for RegistryImageResolver {
    async fn resolve(&self, image: &str) -> Result<(), ImageResolutionError> {
        let reference = ImageReference::parse(image)?;
        let url = self.manifest_url(&reference)?;
        debug!(image = %image, url = %url, "checking image manifest");
        let resp = self
            .client
            .head(url)
            .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ImageResolutionError::Timeout(image.to_string())
                } else {
                    ImageResolutionError::Unreachable {
                        image: image.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ImageResolutionError::NotFound(image.to_string())),
            s @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                Err(ImageResolutionError::Denied {
                    image: image.to_string(),
                    status: s.as_u16(),
                })
            }
            s => Err(ImageResolutionError::Unreachable {
                image: image.to_string(),
                message: format!("unexpected status {}", s),
            }),
        }
    }
}
