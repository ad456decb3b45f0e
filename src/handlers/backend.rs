//! Backend role handlers: mount management for app and file-provider clients.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::handlers::mounts::{MountRegistry, disk_types};
use crate::handlers::shutdown_reply;
use crate::ipc::connection::Connection;
use crate::ipc::frame::Frame;
use crate::ipc::messages::{
    CreateMountRequest, CreateMountResponse, DeleteMountRequest, DeleteMountResponse, ListDiskTypesResponse,
    ListMountsResponse, Message, MessageType, MountRequest, MountResponse, MountStatus, MountStatusUpdate, Role,
    UnmountRequest, UnmountResponse,
};
use crate::ipc::server::{ClientHandle, ClientId, Dispatch, HandlerFactory, RoleHandler};

/// Builds a [`BackendHandler`] for every app or file-provider client.
#[derive(Clone)]
pub struct BackendHandlerFactory {
    registry: MountRegistry,
    helper: Option<Arc<Connection>>,
}

impl BackendHandlerFactory {
    pub fn new(registry: MountRegistry) -> Self {
        Self { registry, helper: None }
    }

    /// Also report mount status changes to the helper over `connection`.
    pub fn with_helper(mut self, connection: Arc<Connection>) -> Self {
        self.helper = Some(connection);
        self
    }
}

impl HandlerFactory for BackendHandlerFactory {
    fn create(&self, client: &ClientHandle) -> Option<Box<dyn RoleHandler>> {
        match client.role {
            Role::App | Role::FileProvider => Some(Box::new(BackendHandler {
                registry: self.registry.clone(),
                helper: self.helper.clone(),
                client: client.id,
            })),
            Role::Backend => {
                warn!("Backend does not serve backend clients (client {})", client.id);
                None
            }
        }
    }
}

/// Per-client handler on the backend.
pub struct BackendHandler {
    registry: MountRegistry,
    helper: Option<Arc<Connection>>,
    client: ClientId,
}

impl BackendHandler {
    /// Report the change to the helper in the background and return the
    /// update frame for the requesting client.
    fn mount_changed(&self, update: MountStatusUpdate) -> Option<Frame> {
        if let Some(helper) = &self.helper {
            let helper = Arc::clone(helper);
            let forwarded = update.clone();
            tokio::spawn(async move {
                if let Err(e) = helper.send(&forwarded).await {
                    debug!("Could not forward status of mount {} to helper: {}", forwarded.mount_id, e);
                }
            });
        }
        update.to_frame().ok()
    }

    async fn set_mounted(&self, frame: &Frame, mount: bool) -> Dispatch {
        let mount_id = if mount {
            MountRequest::from_frame(frame).map(|r| r.mount_id)
        } else {
            UnmountRequest::from_frame(frame).map(|r| r.mount_id)
        };
        let mount_id = match mount_id {
            Ok(id) => id,
            Err(e) => return error_reply(mount, e.to_string()),
        };

        let result = if mount {
            self.registry.mount(mount_id)
        } else {
            self.registry.unmount(mount_id)
        };
        match result {
            Ok(info) => {
                info!("Client {} {} '{}'", self.client, if mount { "mounted" } else { "unmounted" }, info.name);
                let update = MountStatusUpdate {
                    mount_id,
                    name: info.name,
                    status: if mount { MountStatus::Mounted } else { MountStatus::Unmounted },
                    error: String::new(),
                };
                let mut replies = Vec::new();
                if let Ok(frame) = ok_reply(mount) {
                    replies.push(frame);
                }
                replies.extend(self.mount_changed(update));
                Dispatch::Reply(replies)
            }
            Err(e) => error_reply(mount, e.to_string()),
        }
    }
}

fn ok_reply(mount: bool) -> crate::error::Result<Frame> {
    if mount {
        MountResponse::default().to_frame()
    } else {
        UnmountResponse::default().to_frame()
    }
}

fn error_reply(mount: bool, error: String) -> Dispatch {
    if mount {
        Dispatch::reply(&MountResponse { error })
    } else {
        Dispatch::reply(&UnmountResponse { error })
    }
}

#[async_trait]
impl RoleHandler for BackendHandler {
    async fn handle(&mut self, frame: Frame) -> Dispatch {
        let Ok(kind) = frame.message_type() else {
            return Dispatch::Unhandled;
        };
        match kind {
            MessageType::ListMountsRequest => match self.registry.list() {
                Ok(mounts) => Dispatch::reply(&ListMountsResponse {
                    mounts,
                    error: String::new(),
                }),
                Err(e) => Dispatch::reply(&ListMountsResponse {
                    error: e.to_string(),
                    ..Default::default()
                }),
            },
            MessageType::CreateMountRequest => {
                let response = match CreateMountRequest::from_frame(&frame) {
                    Ok(request) => match self.registry.create(&request.name, &request.disk_type, request.config) {
                        Ok(mount) => {
                            info!("Client {} created mount '{}' ({})", self.client, mount.name, mount.mount_id);
                            CreateMountResponse {
                                mount_id: mount.mount_id,
                                error: String::new(),
                            }
                        }
                        Err(e) => CreateMountResponse {
                            error: e.to_string(),
                            ..Default::default()
                        },
                    },
                    Err(e) => CreateMountResponse {
                        error: e.to_string(),
                        ..Default::default()
                    },
                };
                Dispatch::reply(&response)
            }
            MessageType::DeleteMountRequest => {
                let error = match DeleteMountRequest::from_frame(&frame) {
                    Ok(request) => match self.registry.delete(request.mount_id) {
                        Ok(mount) => {
                            info!("Client {} deleted mount '{}'", self.client, mount.name);
                            String::new()
                        }
                        Err(e) => e.to_string(),
                    },
                    Err(e) => e.to_string(),
                };
                Dispatch::reply(&DeleteMountResponse { error })
            }
            MessageType::MountRequest => self.set_mounted(&frame, true).await,
            MessageType::UnmountRequest => self.set_mounted(&frame, false).await,
            MessageType::ListDiskTypesRequest => Dispatch::reply(&ListDiskTypesResponse {
                disk_types: disk_types(),
                error: String::new(),
            }),
            MessageType::ShutdownRequest => shutdown_reply("backend shutting down"),
            _ => Dispatch::Unhandled,
        }
    }

    async fn closed(&mut self) {
        debug!("Backend client {} closed", self.client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::messages::{ListDiskTypesRequest, ListMountsRequest, ShutdownRequest};
    use std::collections::BTreeMap;

    fn handler() -> BackendHandler {
        BackendHandler {
            registry: MountRegistry::new(),
            helper: None,
            client: 1,
        }
    }

    fn replies(dispatch: Dispatch) -> Vec<Frame> {
        match dispatch {
            Dispatch::Reply(frames) | Dispatch::Shutdown(frames) => frames,
            other => panic!("expected a reply, got {:?}", other),
        }
    }

    async fn create(handler: &mut BackendHandler, name: &str, disk_type: &str) -> CreateMountResponse {
        let frame = CreateMountRequest {
            name: name.into(),
            disk_type: disk_type.into(),
            config: BTreeMap::new(),
        }
        .to_frame()
        .unwrap();
        let frames = replies(handler.handle(frame).await);
        CreateMountResponse::from_frame(&frames[0]).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let mut handler = handler();
        let created = create(&mut handler, "docs", "local_directory").await;
        assert!(created.error.is_empty());
        assert_eq!(created.mount_id, 1);

        let frames = replies(handler.handle(ListMountsRequest {}.to_frame().unwrap()).await);
        let listed = ListMountsResponse::from_frame(&frames[0]).unwrap();
        assert_eq!(listed.mounts.len(), 1);
        assert_eq!(listed.mounts[0].name, "docs");
    }

    #[tokio::test]
    async fn test_create_error_is_reported_in_response() {
        let mut handler = handler();
        let created = create(&mut handler, "docs", "floppy").await;
        assert_eq!(created.mount_id, 0);
        assert!(created.error.contains("floppy"));
    }

    #[tokio::test]
    async fn test_mount_emits_status_update() {
        let mut handler = handler();
        let created = create(&mut handler, "share", "smb").await;

        let frame = MountRequest {
            mount_id: created.mount_id,
        }
        .to_frame()
        .unwrap();
        let frames = replies(handler.handle(frame).await);
        assert_eq!(frames.len(), 2);
        assert!(MountResponse::from_frame(&frames[0]).unwrap().error.is_empty());
        let update = MountStatusUpdate::from_frame(&frames[1]).unwrap();
        assert_eq!(update.status, MountStatus::Mounted);
        assert_eq!(update.name, "share");

        let frame = UnmountRequest {
            mount_id: created.mount_id,
        }
        .to_frame()
        .unwrap();
        let frames = replies(handler.handle(frame).await);
        let update = MountStatusUpdate::from_frame(&frames[1]).unwrap();
        assert_eq!(update.status, MountStatus::Unmounted);
    }

    #[tokio::test]
    async fn test_mount_unknown_id() {
        let mut handler = handler();
        let frame = MountRequest { mount_id: 42 }.to_frame().unwrap();
        let frames = replies(handler.handle(frame).await);
        assert_eq!(frames.len(), 1);
        assert!(MountResponse::from_frame(&frames[0]).unwrap().error.contains("42"));
    }

    #[tokio::test]
    async fn test_delete() {
        let mut handler = handler();
        let created = create(&mut handler, "dav", "webdav").await;
        let frame = DeleteMountRequest {
            mount_id: created.mount_id,
        }
        .to_frame()
        .unwrap();
        let frames = replies(handler.handle(frame).await);
        assert!(DeleteMountResponse::from_frame(&frames[0]).unwrap().error.is_empty());
        assert!(handler.registry.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disk_types_and_shutdown() {
        let mut handler = handler();
        let frames = replies(handler.handle(ListDiskTypesRequest {}.to_frame().unwrap()).await);
        assert_eq!(ListDiskTypesResponse::from_frame(&frames[0]).unwrap().disk_types.len(), 6);

        let dispatch = handler.handle(ShutdownRequest {}.to_frame().unwrap()).await;
        assert!(matches!(dispatch, Dispatch::Shutdown(_)));
    }

    #[tokio::test]
    async fn test_unrelated_tags_are_unhandled() {
        let mut handler = handler();
        let frame = Frame::new(MessageType::ListDirRequest.tag(), b"{}".to_vec());
        assert!(matches!(handler.handle(frame).await, Dispatch::Unhandled));
    }
}
