use std::io::Read;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use super::{RemoteObject, RemoteStorage};
use crate::credentials::Authenticator;
use crate::{Error, Result};

const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const CSV_MIME: &str = "text/csv";
const BOUNDARY: &str = "sensorlog-part-boundary-5d1c9e";

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Deserialize)]
struct DriveFile {
    id: String,
    name: String,
}

impl From<DriveFile> for RemoteObject {
    fn from(file: DriveFile) -> Self {
        Self {
            id: file.id,
            name: file.name,
        }
    }
}

/// Google Drive (API v3).
pub struct DriveStorage {
    agent: ureq::Agent,
    auth: Authenticator,
}

impl DriveStorage {
    pub fn new(auth: Authenticator) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(60))
            .timeout_write(Duration::from_secs(60))
            .build();

        Self { agent, auth }
    }

    fn authorization(&mut self) -> Result<String> {
        Ok(format!("Bearer {}", self.auth.access_token()?))
    }
}

impl RemoteStorage for DriveStorage {
    fn find_by_name(&mut self, name: &str) -> Result<Option<RemoteObject>> {
        let authorization = self.authorization()?;
        let url = Url::parse_with_params(
            FILES_URL,
            &[
                ("q", name_query(name).as_str()),
                ("fields", "files(id, name)"),
                ("spaces", "drive"),
            ],
        )
        .map_err(|e| Error::Upload(e.to_string()))?;

        let list: FileList = self
            .agent
            .get(url.as_str())
            .set("authorization", &authorization)
            .call()
            .map_err(upload_error)?
            .into_json()
            .map_err(|e| Error::Upload(format!("bad file list: {e}")))?;

        Ok(list.files.into_iter().next().map(RemoteObject::from))
    }

    fn create(&mut self, name: &str, content: &[u8]) -> Result<RemoteObject> {
        let authorization = self.authorization()?;
        let metadata = serde_json::json!({ "name": name, "mimeType": CSV_MIME });

        let file: DriveFile = self
            .agent
            .post(&format!("{UPLOAD_URL}?uploadType=multipart&fields=id,name"))
            .set("authorization", &authorization)
            .set(
                "content-type",
                &format!("multipart/related; boundary={BOUNDARY}"),
            )
            .send_bytes(&multipart_body(&metadata.to_string(), content))
            .map_err(upload_error)?
            .into_json()
            .map_err(|e| Error::Upload(format!("bad create response: {e}")))?;

        Ok(file.into())
    }

    fn overwrite(&mut self, id: &str, content: &[u8]) -> Result<()> {
        let authorization = self.authorization()?;
        let url = file_url(UPLOAD_URL, id, &[("uploadType", "media")])?;

        self.agent
            .request("PATCH", url.as_str())
            .set("authorization", &authorization)
            .set("content-type", CSV_MIME)
            .send_bytes(content)
            .map_err(upload_error)?;
        Ok(())
    }

    fn download(&mut self, id: &str) -> Result<Vec<u8>> {
        let authorization = self.authorization()?;
        let url = file_url(FILES_URL, id, &[("alt", "media")])?;

        let response = self
            .agent
            .get(url.as_str())
            .set("authorization", &authorization)
            .call()
            .map_err(upload_error)?;

        let mut content = Vec::new();
        response.into_reader().read_to_end(&mut content)?;
        Ok(content)
    }
}

/// Drive search expression matching `name` exactly, skipping trashed files.
fn name_query(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('\'', "\\'");
    format!("name = '{escaped}' and trashed = false")
}

fn file_url(base: &str, id: &str, query: &[(&str, &str)]) -> Result<Url> {
    let mut url = Url::parse_with_params(base, query).map_err(|e| Error::Upload(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| Error::Upload(format!("{base} cannot take a file id")))?
        .push(id);
    Ok(url)
}

fn multipart_body(metadata: &str, content: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
         --{BOUNDARY}\r\nContent-Type: {CSV_MIME}\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_error(err: ureq::Error) -> Error {
    match err {
        ureq::Error::Status(code, response) => Error::Upload(format!(
            "drive returned HTTP {code}: {}",
            response.into_string().unwrap_or_default()
        )),
        ureq::Error::Transport(transport) => {
            Error::Upload(format!("drive transport error: {transport}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_escapes_quotes() {
        assert_eq!(
            name_query("sensor_data.csv"),
            "name = 'sensor_data.csv' and trashed = false"
        );
        assert_eq!(name_query("bob's.csv"), "name = 'bob\\'s.csv' and trashed = false");
    }

    #[test]
    fn file_urls_carry_the_id_as_a_path_segment() {
        let url = file_url(FILES_URL, "1y6PWTviufN4LdqYNTW_BFDaa6OnVc7_1", &[("alt", "media")]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.googleapis.com/drive/v3/files/1y6PWTviufN4LdqYNTW_BFDaa6OnVc7_1?alt=media"
        );
    }

    #[test]
    fn multipart_body_wraps_metadata_and_content() {
        let body = String::from_utf8(multipart_body("{\"name\":\"a.csv\"}", b"x,y\n")).unwrap();
        assert!(body.starts_with(&format!("--{BOUNDARY}\r\nContent-Type: application/json")));
        assert!(body.contains("{\"name\":\"a.csv\"}\r\n"));
        assert!(body.contains("Content-Type: text/csv\r\n\r\nx,y\n\r\n"));
        assert!(body.ends_with(&format!("--{BOUNDARY}--\r\n")));
    }
}
