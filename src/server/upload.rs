//! Chunked upload, reassembly and checksum verdicts.
//!
//! Flow:
//! 1. First chunk: reserve a `FileRecord`, create the destination file
//! 2. Every chunk: validate order and sizes, append ciphertext
//! 3. Last chunk: decrypt in place, compute cksum, wait for a verdict
//! 4. Verdict: mark verified, or delete record and file

use super::session::{Phase, Session, Upload};
use super::Resources;
use crate::crypto;
use crate::error::{Result, TransferError};
use crate::files::sanitize_file_name;
use crate::protocol::{FileChunk, Response};
use crate::store::{FileRecord, Persistence};
use std::io;
use std::time::Instant;
use tokio::io::AsyncWriteExt;

impl<P: Persistence> Resources<P> {
    /// Accept one chunk. The caller finishes the upload once the last chunk is in.
    pub async fn receive_chunk(&self, session: &mut Session, chunk: &FileChunk) -> Result<()> {
        let expected = match session.phase {
            Phase::Keyed => {
                if chunk.chunk_number != 1 {
                    return Err(TransferError::protocol(format!(
                        "upload must start at chunk 1, got {}",
                        chunk.chunk_number
                    )));
                }
                self.begin_upload(session, chunk).await?;
                1
            }
            Phase::Uploading { received } => received + 1,
            phase => {
                return Err(TransferError::protocol(format!(
                    "file chunk while {:?}",
                    phase
                )))
            }
        };

        let upload = session
            .upload
            .as_mut()
            .ok_or_else(|| TransferError::protocol("no upload in progress"))?;

        if chunk.chunk_number != expected {
            return Err(TransferError::protocol(format!(
                "chunk {} out of order, expected {}",
                chunk.chunk_number, expected
            )));
        }
        check_consistent(upload, chunk)?;

        let len = chunk.content.len() as u64;
        if upload.bytes_written + len > upload.content_size as u64 {
            return Err(TransferError::protocol(format!(
                "chunk {} overruns declared content size {}",
                chunk.chunk_number, upload.content_size
            )));
        }

        {
            let _fs = self.coordinator.filesystem(&self.files).await;
            let file = upload
                .file
                .as_mut()
                .ok_or_else(|| TransferError::protocol("upload file already closed"))?;
            file.write_all(&chunk.content).await?;
        }
        upload.bytes_written += len;
        session.phase = Phase::Uploading { received: expected };

        tracing::debug!(
            "Chunk {}/{} of {} ({} bytes)",
            chunk.chunk_number,
            chunk.total_chunks,
            upload.file_name,
            len
        );
        Ok(())
    }

    /// Reserve the record and create the destination file.
    ///
    /// Both happen under the filesystem lock, so a concurrent discard never
    /// sees the record without its file.
    async fn begin_upload(&self, session: &mut Session, chunk: &FileChunk) -> Result<()> {
        if chunk.total_chunks == 0 {
            return Err(TransferError::protocol("total_chunks must be at least 1"));
        }
        let file_name = sanitize_file_name(&chunk.file_name)?;
        let id = session.client_id;
        let (name, symmetric_key) = match (&session.name, &session.symmetric_key) {
            (Some(name), Some(key)) => (name.clone(), key.clone()),
            _ => return Err(TransferError::UnregisteredClient(id.to_string())),
        };
        let path = self.files.file_path(&name, &file_name)?;

        let fs = self.coordinator.filesystem(&self.files).await;
        let record = FileRecord::new(id, &file_name, path);
        let reserved = record.clone();
        self.persist(move |db| {
            if db.file_exists(&id, &reserved.file_name)? {
                return Err(TransferError::DuplicateFile {
                    client_id: id.to_string(),
                    file_name: reserved.file_name,
                });
            }
            db.insert_file(&reserved)
        })
        .await?;

        let file = match fs.create(&record.path).await {
            Ok(file) => file,
            Err(e) => {
                let stale = file_name.clone();
                if let Err(rollback) = self.persist(move |db| db.delete_file(&id, &stale)).await {
                    tracing::warn!("Failed to roll back record for {}: {}", file_name, rollback);
                }
                return Err(e);
            }
        };
        drop(fs);

        tracing::info!(
            "Client {} started upload of {} ({} chunks, {} bytes)",
            id,
            file_name,
            chunk.total_chunks,
            chunk.content_size
        );
        session.upload = Some(Upload {
            file_name,
            path: record.path,
            file: Some(file),
            total_chunks: chunk.total_chunks,
            content_size: chunk.content_size,
            original_size: chunk.original_size,
            bytes_written: 0,
            symmetric_key,
            started: Instant::now(),
        });
        session.phase = Phase::Uploading { received: 0 };
        Ok(())
    }

    /// Decrypt the reassembled file, replace it with the plaintext and checksum it.
    ///
    /// The filesystem lock is held from the flush to the overwrite. If the
    /// record vanished meanwhile, the upload fails and is rolled back.
    pub async fn finish_upload(&self, session: &mut Session) -> Result<Response> {
        let complete = matches!(
            (session.phase, session.upload.as_ref()),
            (Phase::Uploading { received }, Some(u)) if received == u.total_chunks
        );
        if !complete {
            return Err(TransferError::protocol("upload is not complete"));
        }
        let id = session.client_id;
        let upload = session
            .upload
            .as_mut()
            .ok_or_else(|| TransferError::protocol("no upload in progress"))?;

        let fs = self.coordinator.filesystem(&self.files).await;
        if let Some(mut file) = upload.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        let ciphertext = fs.read(&upload.path).await?;
        if ciphertext.len() as u64 != upload.content_size as u64 {
            return Err(TransferError::protocol(format!(
                "received {} bytes, expected {}",
                ciphertext.len(),
                upload.content_size
            )));
        }

        let key = upload.symmetric_key.clone();
        let plaintext = tokio::task::spawn_blocking(move || crypto::decrypt_file(&key, &ciphertext))
            .await
            .map_err(io::Error::other)??;
        if plaintext.len() as u64 != upload.original_size as u64 {
            return Err(TransferError::protocol(format!(
                "decrypted {} bytes, expected {}",
                plaintext.len(),
                upload.original_size
            )));
        }

        let file_name = upload.file_name.clone();
        if !self.persist(move |db| db.file_exists(&id, &file_name)).await? {
            return Err(TransferError::protocol(format!(
                "record of {} was removed during upload",
                upload.file_name
            )));
        }
        let checksum = crypto::cksum(&plaintext);
        fs.overwrite(&upload.path, &plaintext).await?;
        drop(fs);

        tracing::info!(
            "Received {} from client {}: {} bytes in {:.2?}, cksum {}",
            upload.file_name,
            id,
            plaintext.len(),
            upload.started.elapsed(),
            checksum
        );
        let response = Response::FileReceived {
            client_id: id,
            content_size: upload.content_size,
            file_name: upload.file_name.clone(),
            checksum,
        };
        session.phase = Phase::Verifying;
        Ok(response)
    }

    /// Client agrees with the checksum.
    pub async fn confirm_checksum(&self, session: &mut Session, file_name: &str) -> Result<()> {
        let file_name = sanitize_file_name(file_name)?;
        let id = session.client_id;
        let name = file_name.clone();
        if !self.persist(move |db| db.mark_verified(&id, &name)).await? {
            return Err(TransferError::InexistentFile {
                client_id: id.to_string(),
                file_name,
            });
        }

        session.upload = None;
        session.phase = Phase::Completed;
        tracing::info!("Client {} verified {}", id, file_name);
        Ok(())
    }

    /// Client disagrees with the checksum: drop record and file.
    ///
    /// With `abort` the session ends, otherwise the client may upload again.
    pub async fn discard_file(
        &self,
        session: &mut Session,
        file_name: &str,
        abort: bool,
    ) -> Result<()> {
        let file_name = sanitize_file_name(file_name)?;
        let id = session.client_id;
        {
            let fs = self.coordinator.filesystem(&self.files).await;
            let name = file_name.clone();
            let record = self
                .persist(move |db| db.delete_file(&id, &name))
                .await?
                .ok_or_else(|| TransferError::InexistentFile {
                    client_id: id.to_string(),
                    file_name: file_name.clone(),
                })?;
            fs.remove(&record.path).await?;
        }

        session.reset_upload();
        if abort {
            session.phase = Phase::Aborted;
            tracing::warn!("Client {} aborted upload of {}", id, file_name);
        } else {
            tracing::warn!("Client {} will retry upload of {}", id, file_name);
        }
        Ok(())
    }

    /// Throw away a half-finished upload. Failures are only logged.
    pub async fn abandon_upload(&self, session: &mut Session) {
        let Some(mut upload) = session.reset_upload() else {
            return;
        };
        let id = session.client_id;
        drop(upload.file.take());

        let fs = self.coordinator.filesystem(&self.files).await;
        let name = upload.file_name.clone();
        if let Err(e) = self.persist(move |db| db.delete_file(&id, &name)).await {
            tracing::warn!("Failed to drop record for {}: {}", upload.file_name, e);
        }
        if let Err(e) = fs.remove(&upload.path).await {
            tracing::warn!("Failed to remove partial file {}: {}", upload.path.display(), e);
        }
        tracing::warn!("Abandoned upload of {} from client {}", upload.file_name, id);
    }
}

fn check_consistent(upload: &Upload, chunk: &FileChunk) -> Result<()> {
    if chunk.total_chunks != upload.total_chunks
        || chunk.content_size != upload.content_size
        || chunk.original_size != upload.original_size
    {
        return Err(TransferError::protocol(format!(
            "chunk {} disagrees with upload header of {}",
            chunk.chunk_number, upload.file_name
        )));
    }
    if sanitize_file_name(&chunk.file_name)? != upload.file_name {
        return Err(TransferError::protocol(format!(
            "chunk for {:?} during upload of {}",
            chunk.file_name, upload.file_name
        )));
    }
    Ok(())
}
